pub use timer::{TickClock, Timeout, Timer};

mod timer;
