use std::io::Write;

use eyre::{Context, eyre};
use http::{HeaderName, HeaderValue, Method};
use pinfetch::{FetchOptions, FetchRequest, SafeFetcher};

pub struct FetchArgs {
    pub url: String,
    pub method: String,
    pub headers: Vec<String>,
    pub data: Option<String>,
    pub max_redirects: Option<usize>,
    pub include: bool,
}

/// Fetch a URL writing the response body to stdout
pub async fn fetch(mut options: FetchOptions, args: FetchArgs) -> eyre::Result<()> {
    if let Some(max_redirects) = args.max_redirects {
        options.max_redirects = max_redirects;
    }

    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid method {}", args.method))?;

    let mut request = FetchRequest::new(method, args.url);

    for header in &args.headers {
        let (name, value) = parse_header(header)?;
        request = request.header(name, value);
    }

    if let Some(data) = args.data {
        request = request.body(data);
    }

    let fetcher = SafeFetcher::from_options(options);
    let response = fetcher.fetch(request).await?;

    let mut stdout = std::io::stdout().lock();

    if args.include {
        let attempts = serde_json::to_string_pretty(&response.attempts)
            .context("failed to serialize attempts")?;
        eprintln!("{attempts}");

        writeln!(stdout, "{}", response.status)?;
        for (name, value) in &response.headers {
            writeln!(stdout, "{name}: {}", String::from_utf8_lossy(value.as_bytes()))?;
        }
        writeln!(stdout)?;
    }

    stdout.write_all(&response.body)?;
    stdout.flush()?;

    Ok(())
}

/// Parse a header in the form `name: value`
fn parse_header(header: &str) -> eyre::Result<(HeaderName, HeaderValue)> {
    let (name, value) = header
        .split_once(':')
        .ok_or_else(|| eyre!("header {header:?} must be in the form 'name: value'"))?;

    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .with_context(|| format!("invalid header name in {header:?}"))?;
    let value = HeaderValue::from_str(value.trim())
        .with_context(|| format!("invalid header value in {header:?}"))?;

    Ok((name, value))
}
