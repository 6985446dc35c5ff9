use clap::Args;

use crate::port::DEFAULT_PORT_RANGE;

#[derive(Args)]
pub struct FindPortCommand {
    /// Lowest candidate port
    #[arg(long, default_value_t = DEFAULT_PORT_RANGE.0)]
    pub min: u16,

    /// Highest candidate port
    #[arg(long, default_value_t = DEFAULT_PORT_RANGE.1)]
    pub max: u16,
}
