pub mod supervisor;
pub mod traits;

pub use supervisor::{RadioError, RadioSupervisor};
pub use traits::{ModulationParams, Phy, RadioState, TxParams};
