//! Boundary to the external gas delivery subsystem.
//!
//! Flow setpoints and MFC ramping live in that system; this side only asks
//! for approval, forwards setpoints and, during rollback, slams everything
//! shut. Implementations adapt whatever bus the gas controller speaks.

pub trait GasInterface: Send + Sync {
    /// Ask the gas subsystem whether a flow may start. A refusal is not an
    /// error, just a denial.
    fn request_flow_approval(&self, gas: &str, sccm: f64) -> bool;

    fn command_flow(&self, gas: &str, sccm: f64);

    /// Best effort, called during rollback. Must not block.
    fn stop_all_flows(&self);
}

/// Stand-in for systems with no gas controller attached. Nothing objects to
/// a flow start; the gas valve relays remain the only thing that actually
/// gates gas.
pub struct NullGas;

impl GasInterface for NullGas {
    fn request_flow_approval(&self, _gas: &str, _sccm: f64) -> bool {
        true
    }

    fn command_flow(&self, _gas: &str, _sccm: f64) {}

    fn stop_all_flows(&self) {}
}
