use cli::{parse_args, Command, Endpoint};
use flowio::io::{AsyncReadSource, AsyncWriteSink, FileSink, FileSource, HashSink};
use flowio::{pipe, Readable, StreamError, StreamOptions, Writable};
use tracing::{debug, info};

fn open_readable(src: &Endpoint, options: StreamOptions) -> Result<Readable, StreamError> {
    let readable = match src {
        Endpoint::Std => Readable::new(AsyncReadSource::new(tokio::io::stdin()), options)?,
        Endpoint::Path(path) => Readable::new(FileSource::new(path), options)?,
    };
    Ok(readable.named(&src.to_string()))
}

fn open_writable(dst: &Endpoint, options: StreamOptions) -> Result<Writable, StreamError> {
    let writable = match dst {
        Endpoint::Std => Writable::new(AsyncWriteSink::new(tokio::io::stdout()), options)?,
        Endpoint::Path(path) => Writable::new(FileSink::create(path), options)?,
    };
    Ok(writable.named(&dst.to_string()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so that `copy <src> -` keeps stdout clean
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let invocation = parse_args(std::env::args().skip(1))?;
    let config = invocation.stream_config()?;
    debug!(?config, "stream options");

    match &invocation.command {
        Command::Copy { src, dst } => {
            let mut readable = open_readable(src, config.readable)?;
            let mut writable = open_writable(dst, config.writable)?;
            let stats = pipe(&mut readable, &mut writable).await?;
            info!(%src, %dst, peak_buffered = stats.peak_buffered, "copy complete");
            eprintln!("{} bytes copied, {} pauses", stats.bytes, stats.pauses);
        }
        Command::Hash { src } => {
            let sink = HashSink::new();
            let digest = sink.digest_handle();
            let mut readable = open_readable(src, config.readable)?;
            let mut writable = Writable::new(sink, config.writable)?.named("sha256");
            let stats = pipe(&mut readable, &mut writable).await?;
            let hex = digest.hex().ok_or("digest was not produced")?;
            info!(%src, bytes = stats.bytes, "hash complete");
            println!("{hex}  {src}");
        }
    }
    Ok(())
}
