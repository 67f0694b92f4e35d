mod acknowledgment;
mod batch;
mod batch_accumulator;
mod intake;
mod intake_queue;
mod validator;

#[cfg(test)]
pub(crate) mod test_support;

pub use acknowledgment::*;
pub use batch::*;
pub use batch_accumulator::*;
pub use intake::*;
pub use intake_queue::*;
pub use validator::*;
