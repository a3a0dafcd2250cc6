pub mod dose;
pub mod medication;
pub mod report;

pub use dose::*;
pub use medication::*;
pub use report::*;
