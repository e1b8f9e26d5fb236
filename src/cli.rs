use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use aqqu_frontend::backend::BackendEndpoint;
use aqqu_frontend::images::{self, FetchOptions, RetryPolicy};
use aqqu_frontend::mapping::{self, MappingSources};
use aqqu_frontend::web::{self, WebConfig};
use aqqu_frontend::{EntityIndex, WikiInfo};
use atty::Stream;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use termimad::{FmtText, MadSkin, terminal_size};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "aqqu-frontend",
    about = "Serve and maintain the Aqqu question answering front-end",
    version
)]
pub struct Cli {
    /// Emit JSON instead of human-readable tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the web front-end.
    Serve(ServeArgs),
    /// Show the Wikipedia information stored for QIDs or Freebase MIDs.
    Lookup {
        /// One or more QIDs (or MIDs with `--mid`).
        #[arg(required = true)]
        ids: Vec<String>,
        /// Interpret the IDs as Freebase MIDs.
        #[arg(long)]
        mid: bool,
        #[arg(long, env = "AQQU_DATA_DIR", default_value = "data")]
        data_dir: PathBuf,
    },
    /// Build the QID to Wikipedia title/image/abstract mapping.
    BuildMapping(BuildMappingArgs),
    /// Query the Wikipedia API for a thumbnail of every mapped article.
    FetchImages(FetchImagesArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Port to listen on.
    port: u16,
    /// Address to bind.
    #[arg(long, default_value = "::")]
    host: IpAddr,
    /// Directory holding the TSV mapping files.
    #[arg(long, env = "AQQU_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,
    /// Directory with the browser assets served under `/static`.
    #[arg(long, env = "AQQU_STATIC_DIR", default_value = "static")]
    static_dir: PathBuf,
    #[arg(long, env = "AQQU_HOST", default_value = "titan.informatik.privat")]
    aqqu_host: String,
    #[arg(long, env = "AQQU_PORT", default_value_t = 8300)]
    aqqu_port: u16,
    #[arg(long, env = "QAC_HOST", default_value = "nkaba.informatik.privat")]
    qac_host: String,
    #[arg(long, env = "QAC_PORT", default_value_t = 8181)]
    qac_port: u16,
    /// Give up on a backend call after this many seconds.
    #[arg(long)]
    backend_timeout_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct BuildMappingArgs {
    /// File to which to write the resulting mapping.
    #[arg(short, long = "output-file", default_value = "data/qid_to_wikipedia_info.tsv")]
    output: PathBuf,
    /// File that contains the qid-to-title mapping.
    #[arg(short, long = "title-file", default_value = "data/qid_to_title.tsv")]
    titles: PathBuf,
    /// File that contains the qid-to-image mapping.
    #[arg(short, long = "image-file", default_value = "data/qid_to_image.tsv")]
    images: PathBuf,
    /// File that contains the qid-to-abstract mapping.
    #[arg(short, long = "abstract-file", default_value = "data/qid_to_abstract.tsv")]
    abstracts: PathBuf,
    /// Wikipedia image mapping to combine with the Wikidata image file.
    #[arg(short, long)]
    combine: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct FetchImagesArgs {
    /// File to which to write the qid-to-thumbnail mapping.
    output: PathBuf,
    /// Mapping whose titles are looked up.
    #[arg(short, long, default_value = "data/qid_to_wikipedia_info.tsv")]
    input: PathBuf,
    #[arg(long, default_value_t = images::DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    #[arg(long, default_value_t = images::DEFAULT_THUMB_SIZE)]
    thumb_size: u32,
    /// Attempts per batch before its titles are recorded as errors.
    #[arg(long, default_value_t = RetryPolicy::default().max_attempts)]
    max_attempts: u32,
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing();
    match cli.command {
        Command::Serve(args) => handle_serve(args),
        Command::Lookup { ids, mid, data_dir } => handle_lookup(ids, mid, data_dir, cli.json),
        Command::BuildMapping(args) => handle_build_mapping(args, cli.json),
        Command::FetchImages(args) => handle_fetch_images(args, cli.json),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn runtime() -> Result<tokio::runtime::Runtime, Box<dyn Error>> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn handle_serve(args: ServeArgs) -> Result<(), Box<dyn Error>> {
    let config = WebConfig {
        addr: SocketAddr::new(args.host, args.port),
        data_dir: args.data_dir,
        static_dir: args.static_dir,
        aqqu: BackendEndpoint::new(args.aqqu_host, args.aqqu_port),
        qac: BackendEndpoint::new(args.qac_host, args.qac_port),
        backend_timeout: args.backend_timeout_secs.map(Duration::from_secs),
    };
    runtime()?.block_on(web::serve(config))?;
    Ok(())
}

fn handle_lookup(
    ids: Vec<String>,
    by_mid: bool,
    data_dir: PathBuf,
    as_json: bool,
) -> Result<(), Box<dyn Error>> {
    let index = EntityIndex::load(&data_dir)?;
    let rows: Vec<(String, Option<String>, &WikiInfo)> = ids
        .into_iter()
        .map(|id| {
            if by_mid {
                let qid = index.qid_for_mid(&id).map(str::to_string);
                let info = index.info_by_mid(&id);
                (id, qid, info)
            } else {
                let info = index.info_by_qid(&id);
                (id.clone(), Some(id), info)
            }
        })
        .collect();

    if as_json {
        let payload: Vec<_> = rows
            .iter()
            .map(|(id, qid, info)| {
                json!({
                    "id": id,
                    "qid": qid,
                    "title": info.title,
                    "url": info.url(),
                    "image": info.image,
                    "abstract": info.abstract_text,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (id, qid, info) in &rows {
            print_info(id, qid.as_deref(), info);
        }
    }
    Ok(())
}

fn handle_build_mapping(args: BuildMappingArgs, as_json: bool) -> Result<(), Box<dyn Error>> {
    let sources = MappingSources {
        titles: args.titles,
        images: args.images,
        abstracts: args.abstracts,
        image_overrides: args.combine,
    };
    let stats = mapping::build_info_mapping(&sources, &args.output)?;
    if as_json {
        let payload = json!({
            "output": args.output.display().to_string(),
            "titles": stats.titles,
            "images": stats.images,
            "abstracts": stats.abstracts,
            "written": stats.written,
            "skipped_lines": stats.skipped_lines,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_counts(&[
            ("TITLES", stats.titles),
            ("IMAGES", stats.images),
            ("ABSTRACTS", stats.abstracts),
            ("WRITTEN", stats.written),
            ("SKIPPED_LINES", stats.skipped_lines),
        ]);
    }
    Ok(())
}

fn handle_fetch_images(args: FetchImagesArgs, as_json: bool) -> Result<(), Box<dyn Error>> {
    if args.batch_size == 0 {
        return Err("Batch size must be at least 1".into());
    }
    let titles = images::read_title_list(&args.input)?;
    info!(path = %args.input.display(), titles = titles.len(), "Read article titles");
    let options = FetchOptions {
        batch_size: args.batch_size,
        thumb_size: args.thumb_size,
        retry: RetryPolicy {
            max_attempts: args.max_attempts.max(1),
            ..RetryPolicy::default()
        },
        ..FetchOptions::default()
    };
    let stats = runtime()?.block_on(images::fetch_image_mapping(titles, &args.output, &options))?;
    if as_json {
        let payload = json!({
            "output": args.output.display().to_string(),
            "errors_file": images::error_file_path(&args.output).display().to_string(),
            "qids": stats.qids,
            "urls": stats.urls,
            "errors": stats.errors,
            "batches": stats.batches,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_counts(&[
            ("QIDS", stats.qids),
            ("URLS", stats.urls),
            ("ERRORS", stats.errors),
            ("BATCHES", stats.batches),
        ]);
    }
    Ok(())
}

fn print_counts(rows: &[(&str, usize)]) {
    let width = rows
        .iter()
        .map(|(label, _)| label.len())
        .max()
        .unwrap_or(5)
        .max("FIELD".len());
    println!("{:<width$}  {}", "FIELD", "COUNT", width = width);
    println!("{:-<width$}  {}", "", "-----", width = width);
    for (label, count) in rows {
        println!("{:<width$}  {}", label, count, width = width);
    }
}

fn print_info(id: &str, qid: Option<&str>, info: &WikiInfo) {
    match qid {
        Some(qid) if qid != id => println!("{id} ({qid})"),
        Some(_) => println!("{id}"),
        None => {
            println!("{id}: <no QID mapped>");
            return;
        }
    }
    if info.is_empty() {
        println!("  <missing>");
        return;
    }
    println!("  Title: {}", display_or_missing(&info.title));
    println!("  URL:   {}", info.url().unwrap_or_else(|| "<missing>".to_string()));
    println!("  Image: {}", display_or_missing(&info.image));
    render_markdown_block("Abstract", &info.abstract_text);
    println!();
}

fn display_or_missing(value: &str) -> &str {
    if value.is_empty() { "<missing>" } else { value }
}

fn stdout_is_tty() -> bool {
    atty::is(Stream::Stdout)
}

fn markdown_width() -> usize {
    let (width, _) = terminal_size();
    width.max(60) as usize
}

fn render_markdown_block(title: &str, body: &str) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return;
    }
    println!("  {title}:");
    if stdout_is_tty() {
        let skin = MadSkin::default();
        let formatted = FmtText::from(&skin, trimmed, Some(markdown_width()));
        println!("{formatted}");
    } else {
        println!("  {trimmed}");
    }
}
