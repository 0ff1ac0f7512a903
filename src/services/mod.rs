// Collaborators consumed by the capture scheduler
pub mod orders;
pub mod payments;
