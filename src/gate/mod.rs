//! Admission gates and their configuration.

mod key;
mod quota;
mod registry;
mod rules;

pub use key::QuotaKey;
pub use quota::{QuotaGate, QuotaGateBuilder};
pub use registry::GateRegistry;
pub use rules::{GateRules, MethodRule, ServiceRules};
