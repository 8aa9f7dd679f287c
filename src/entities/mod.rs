pub mod item;
pub mod order;
pub mod order_item;
pub mod order_status_history;
pub mod payment_detail;
pub mod reservation;
pub mod reservation_line;

pub use item::{ItemDetails, ItemKind};
pub use order::{InventoryStatus, OrderNote, OrderStatus, PaymentStatus};
pub use reservation::ReservationStatus;
