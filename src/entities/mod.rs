pub mod order;
pub mod order_item;
pub mod payment;
pub mod payment_collection;

pub use order::{Entity as Order, OrderStatus};
pub use order_item::Entity as OrderItem;
pub use payment::{Entity as Payment, PaymentStatus};
pub use payment_collection::{Entity as PaymentCollection, PaymentCollectionStatus};
