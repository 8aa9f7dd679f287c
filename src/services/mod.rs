pub mod items;
pub mod orchestrator;
pub mod orders;
pub mod payments;
pub mod reservations;

pub use items::ItemService;
pub use orchestrator::{register_consumers, OrderOrchestrator, ReservationWorker};
pub use orders::OrderService;
pub use payments::PaymentDetailsService;
pub use reservations::{ReservationEngine, ReserveLine, ReserveOutcome};
