use clap::Parser;
use training::{run_train, TrainArgs};

fn main() -> anyhow::Result<()> {
    let args = TrainArgs::parse();
    let summary = run_train(args)?;
    println!(
        "Training finished: {} iterations, {} checkpoints in {}",
        summary.iterations,
        summary.checkpoints.len(),
        summary.snapshot_dir.display()
    );
    Ok(())
}
