use anyhow::Error;

use crate::program::Program;

mod harvest;
mod program;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config_dir = std::env::args().nth(1);
    let program = Program::new(config_dir);
    program.run().await
}
