pub mod layout;
pub mod manager;
pub mod measurer;
pub mod namespacer;

pub use layout::StoreLayout;
pub use manager::{InitSpec, StoreManager};
pub use measurer::StoreMeasurer;
pub use namespacer::StoreNamespacer;
