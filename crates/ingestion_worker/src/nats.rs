mod reading_subscriber;
mod sensor_demo_producer;

pub use reading_subscriber::*;
pub use sensor_demo_producer::*;
