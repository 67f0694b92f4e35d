mod reading;
mod repository;
mod result;

pub use reading::*;
pub use repository::*;
pub use result::*;
