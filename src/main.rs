use clap::Parser;
use mproxy::serve::{self, BootArgs};

fn main() -> mproxy::Result<()> {
    serve::run(BootArgs::parse())
}
