//! CLI построения графа декодирования HCLG.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use decoding_graph::{TracingSink, build};

#[derive(Parser, Debug)]
#[command(name = "create-decoding-graph")]
#[command(author, version, about = "Create the decoding graph for decoding", long_about = None)]
struct Cli {
    /// Path to the HCL_inv automaton (serialized)
    #[arg(long = "HCL-inv-path")]
    hcl_inv_path: PathBuf,

    /// Path to the LM automaton (OpenFst text, or serialized with a .pt/.safetensors suffix)
    #[arg(long = "G-path")]
    g_path: PathBuf,

    /// Directory to save the decoding graph
    #[arg(long, default_value = "data")]
    out_dir: PathBuf,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("LOGLEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .init();

    let cli = Cli::parse();
    let mut sink = TracingSink;
    build(&cli.hcl_inv_path, &cli.g_path, &cli.out_dir, &mut sink).with_context(|| {
        format!(
            "failed to build the decoding graph from {} and {}",
            cli.hcl_inv_path.display(),
            cli.g_path.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let cli = Cli::try_parse_from([
            "create-decoding-graph",
            "--HCL-inv-path",
            "hcl_inv.pt",
            "--G-path",
            "G.txt",
        ])
        .unwrap();
        assert_eq!(cli.hcl_inv_path, PathBuf::from("hcl_inv.pt"));
        assert_eq!(cli.out_dir, PathBuf::from("data"));
        assert!(Cli::try_parse_from(["create-decoding-graph", "--G-path", "G.txt"]).is_err());
    }
}
