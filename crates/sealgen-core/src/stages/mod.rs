pub mod country_shares;
pub mod s0_gate;

pub use country_shares::{CountryShareOutput, CountryShareRow, CountryShareStage, MerchantPriors};
pub use s0_gate::{S0GateStage, S0Inputs, S0Output};
