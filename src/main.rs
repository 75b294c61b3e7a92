use anyhow::Result;

fn main() -> Result<()> {
    opslog::cli::run()
}
