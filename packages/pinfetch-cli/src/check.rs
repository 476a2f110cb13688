use eyre::{Context, eyre};
use pinfetch::{FetchOptions, SafeFetcher};

/// Validate `url` and print the outcome as JSON
pub async fn check(options: FetchOptions, url: String) -> eyre::Result<()> {
    let fetcher = SafeFetcher::from_options(options);
    let outcome = fetcher.check(&url).await?;

    let output = serde_json::to_string_pretty(&outcome).context("failed to serialize outcome")?;
    println!("{output}");

    if !outcome.is_validated() {
        return Err(eyre!("{url} was rejected"));
    }

    Ok(())
}
