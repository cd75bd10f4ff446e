//! Parse command-line arguments.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[clap(
    name = "uamirror",
    about = "Mirror an OPC UA server address space into a local subject graph"
)]
pub struct Opt {
    #[clap(
        short = 'c',
        long,
        value_name = "FILE",
        help = "Override default config file path"
    )]
    pub config: Option<PathBuf>,

    #[clap(
        short,
        long,
        value_name = "URL",
        help = "OPC UA endpoint to connect to (e.g. opc.tcp://host:4840)"
    )]
    pub url: Option<String>,

    #[clap(
        short,
        long,
        value_name = "NAME",
        help = "Application name announced to the server"
    )]
    pub application_name: Option<String>,

    #[clap(
        long,
        help = "Run against the built-in simulated server instead of a real endpoint"
    )]
    pub simulate: bool,
}

impl Opt {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
