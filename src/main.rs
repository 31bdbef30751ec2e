use anyhow::Error;

use crate::program::Program;

mod danbooru;
mod program;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let program = Program::new(args);
    program.run().await
}
