//! Command-line arguments for the demonstration binary.

use clap::{Parser, ValueEnum};
use interzone::Encoding;

/// Two in-process zones, one exposed calculator, round-trip calls between
/// them. A minimal end-to-end exercise of the runtime.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Left operand passed to the remote calculator
    #[arg(long, default_value_t = 2)]
    pub lhs: i64,

    /// Right operand passed to the remote calculator
    #[arg(long, default_value_t = 3)]
    pub rhs: i64,

    /// Number of round-trip calls to make
    #[arg(short = 'n', long, default_value_t = 1)]
    pub calls: u32,

    /// Payload encoding for the session
    #[arg(short, long, value_enum, default_value_t = EncodingArg::Binary)]
    pub encoding: EncodingArg,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingArg {
    /// Compact binary
    Binary,
    /// Binary wrapped in zlib
    Compressed,
    /// Self-describing JSON
    Json,
}

impl From<EncodingArg> for Encoding {
    fn from(arg: EncodingArg) -> Self {
        match arg {
            EncodingArg::Binary => Encoding::Binary,
            EncodingArg::Compressed => Encoding::CompressedBinary,
            EncodingArg::Json => Encoding::Json,
        }
    }
}
