use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = procwatch::pw::cli::Args::parse();
    let code = procwatch::pw::cli::run(args).await?;
    std::process::exit(code);
}
