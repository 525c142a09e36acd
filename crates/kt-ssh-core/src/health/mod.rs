//! HealthSupervisor: end-to-end and tunnel-listener probes (§4.4)

mod supervisor;

pub use supervisor::HealthSupervisor;
