//! Service schemas served by twinport.

pub mod greeter;
