use std::io::Write;
use std::sync::Arc;

use rowstream_client::{ReadMode, ReadOptions, Reader, RowIterator};
use rowstream_common::{CancellationToken, JobRef, ReadConfig, Schema, TableRef, Value};
use rowstream_rest::{HttpRestService, RowSource};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }
    let opts = parse_opts(&args)?;

    let config = ReadConfig::from_env();
    let mut rest = HttpRestService::new(config.rest_endpoint.clone())?;
    let token = std::env::var("ROWSTREAM_ACCESS_TOKEN").ok();
    if let Some(token) = &token {
        rest = rest.with_access_token(token.clone());
    }
    let reader = Reader::new(Arc::new(rest), config);

    #[cfg(feature = "grpc")]
    let reader = match std::env::var("ROWSTREAM_STORAGE_ENDPOINT") {
        Ok(endpoint) => {
            let mut client = rowstream_storage::grpc::GrpcReadClient::connect(&endpoint).await?;
            if let Some(token) = &token {
                client = client.with_access_token(token.clone());
            }
            reader.with_read_client(Arc::new(client))
        }
        Err(_) => reader,
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut read_opts = ReadOptions::default()
        .with_mode(opts.mode)
        .with_start_index(opts.start_index);
    if let Some(page_size) = opts.page_size {
        read_opts = read_opts.with_page_size(page_size);
    }
    let mut it = reader.read(opts.source, read_opts, &cancel).await?;
    let written = print_rows(&mut it, opts.max_rows).await?;
    tracing::info!(
        rows = written,
        total_rows = it.total_rows(),
        accelerated = it.is_accelerated(),
        "read finished"
    );
    Ok(())
}

#[derive(Debug)]
struct CliOpts {
    source: RowSource,
    mode: ReadMode,
    page_size: Option<i64>,
    start_index: u64,
    max_rows: Option<u64>,
}

fn parse_opts(args: &[String]) -> Result<CliOpts, Box<dyn std::error::Error>> {
    // rowstream read <project>.<dataset>.<table> [flags]
    // rowstream job <project>:<job_id> [--location L] [flags]
    let command = args[0].as_str();
    let target = args.get(1).ok_or("missing read target")?;
    let mut location = None;
    let mut mode = ReadMode::Auto;
    let mut page_size = None;
    let mut start_index = 0;
    let mut max_rows = None;

    let mut i = 2usize;
    while i < args.len() {
        match args[i].as_str() {
            "--page-size" => {
                i += 1;
                page_size = Some(args.get(i).ok_or("missing value for --page-size")?.parse()?);
            }
            "--start-index" => {
                i += 1;
                start_index = args.get(i).ok_or("missing value for --start-index")?.parse()?;
            }
            "--max-rows" => {
                i += 1;
                max_rows = Some(args.get(i).ok_or("missing value for --max-rows")?.parse()?);
            }
            "--location" => {
                i += 1;
                location = Some(args.get(i).cloned().ok_or("missing value for --location")?);
            }
            "--rest" => mode = ReadMode::Rest,
            "--storage" => mode = ReadMode::Storage,
            other => return Err(format!("unknown argument: {other}").into()),
        }
        i += 1;
    }

    let source = match command {
        "read" => RowSource::table(target.parse::<TableRef>()?),
        "job" => {
            let mut job = target.parse::<JobRef>()?;
            if let Some(location) = location {
                job = job.with_location(location);
            }
            RowSource::job(job)
        }
        other => return Err(format!("unknown command: {other}").into()),
    };
    Ok(CliOpts {
        source,
        mode,
        page_size,
        start_index,
        max_rows,
    })
}

async fn print_rows(
    it: &mut RowIterator,
    max_rows: Option<u64>,
) -> Result<u64, Box<dyn std::error::Error>> {
    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    let mut written = 0u64;
    while max_rows.map_or(true, |max| written < max) {
        let Some(row) = it.next().await? else {
            break;
        };
        let line = serde_json::to_string(&row_json(it.schema(), row))?;
        writeln!(out, "{line}")?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}

/// Object keyed by column name; positional array when the schema is unknown.
fn row_json(schema: &Schema, row: Vec<Value>) -> serde_json::Value {
    if schema.len() != row.len() {
        return serde_json::json!(row);
    }
    schema
        .fields
        .iter()
        .zip(row)
        .map(|(field, value)| (field.name.clone(), serde_json::json!(value)))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  rowstream read <project>.<dataset>.<table> [options]");
    eprintln!("  rowstream job <project>:<job_id> [--location L] [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --page-size N     REST page size (default: server chosen)");
    eprintln!("  --start-index N   first row offset for REST reads");
    eprintln!("  --max-rows N      stop after N rows");
    eprintln!("  --rest            force REST paging");
    eprintln!("  --storage         force storage streaming (needs the grpc feature)");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  ROWSTREAM_ACCESS_TOKEN      bearer token for API calls");
    eprintln!("  ROWSTREAM_STORAGE_ENDPOINT  storage read endpoint (grpc feature)");
    eprintln!("  ROWSTREAM_PAGE_SIZE, ROWSTREAM_REST_ENDPOINT, ROWSTREAM_RETRY_*,");
    eprintln!("  ROWSTREAM_MAX_STREAM_COUNT, ROWSTREAM_MAX_WORKER_COUNT");
}
