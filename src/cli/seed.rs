use std::path::Path;

use anyhow::{Context, Result};

use crate::core::catalog::{apply_seed, load_seed_file};
use crate::core::config::DATABASE_FILE;
use crate::core::store::Store;
use crate::core::terminal::{GuideSection, print_step, print_success};
use crate::core::vault::SecretCipher;

pub async fn run_seed(data_dir: &Path, file: &Path) -> Result<()> {
    print_step(&format!("Loading catalog from {}", file.display()));
    let seed = load_seed_file(file).await?;

    let cipher = SecretCipher::new().context("initializing credential cipher")?;
    let store = Store::open(data_dir.join(DATABASE_FILE), cipher).await?;
    let report = apply_seed(&store, &seed).await?;

    print_success("Catalog seeded.");
    GuideSection::new("Seed Report")
        .status("Executors", &report.executors.to_string())
        .status("Capabilities", &report.capabilities.to_string())
        .status(
            "Credentials",
            &format!(
                "{} added, {} updated",
                report.credentials_added, report.credentials_updated
            ),
        )
        .status("Bindings", &report.bindings.to_string())
        .print();
    println!();
    Ok(())
}
