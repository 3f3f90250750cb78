use clap::Parser;
use miette::Result;

mod broker;
mod common;
mod controller;
mod worker;

#[derive(Debug, Parser)]
#[clap(name = "Lattica")]
#[clap(bin_name = "lattica")]
#[clap(author, version, about, long_about = None)]
enum Lattica {
    /// Run the central coordinator.
    Broker(broker::Args),
    /// Run a strip evolver and register it with a broker.
    Worker(worker::Args),
    /// Drive a simulation against a broker.
    Controller(controller::Args),
}

fn main() -> Result<()> {
    let args = Lattica::parse();

    match args {
        Lattica::Broker(x) => broker::run(&x),
        Lattica::Worker(x) => worker::run(&x),
        Lattica::Controller(x) => controller::run(&x),
    }
}
