use anyhow::Context;

fn main() -> anyhow::Result<()> {
    shelfwise::run().context("shelfwise failed")
}
