use std::io;
use std::path::PathBuf;
use std::process;

use avbsign::sparse::print_sparse_info;
use avbsign::*;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Sign AOSP platform images for verified boot (AVB): add the hash-tree
/// footer, generate the vbmeta image and verify the result.
#[derive(Parser, Debug)]
#[command(
    name = "avbsign",
    version,
    about = "Sign AOSP images for verified boot (hash-tree footer + vbmeta)"
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// AOSP source tree the image was built from
    #[arg(short = 't', long = "tree", required_unless_present_any = ["list", "list_algorithms"])]
    tree: Option<PathBuf>,

    /// Tree release (defaults to the tree directory name)
    #[arg(long = "revision")]
    revision: Option<String>,

    /// Product name, as keyed in the signing-info table (e.g. enchilada)
    #[arg(short = 'p', long = "product", required_unless_present_any = ["list", "list_algorithms"])]
    product: Option<String>,

    /// Signing key (PEM)
    #[arg(short = 'k', long = "key", required_unless_present_any = ["list", "list_algorithms"])]
    key: Option<PathBuf>,

    /// Sparse image to sign
    #[arg(short = 'i', long = "image", required_unless_present_any = ["list", "list_algorithms"])]
    image: Option<PathBuf>,

    /// Directory holding the images whose descriptors go into vbmeta
    #[arg(long = "other-images", required_unless_present_any = ["list", "list_algorithms"])]
    other_images: Option<PathBuf>,

    /// Output directory for the signed image set
    #[arg(short = 'o', long = "output", required_unless_present_any = ["list", "list_algorithms"])]
    output: Option<PathBuf>,

    /// Signing-info table (overrides the configuration file)
    #[arg(long = "signing-info")]
    signing_info: Option<PathBuf>,

    /// Verification timeout in seconds (overrides the configuration file)
    #[arg(long = "timeout", value_parser = clap::value_parser!(u64).range(1..))]
    timeout: Option<u64>,

    /// List the sparse header of an image and exit
    #[arg(short = 'l', long = "list", value_name = "IMAGE")]
    list: Option<PathBuf>,

    /// List supported hash and signing algorithms and exit
    #[arg(long = "list-algorithms")]
    list_algorithms: bool,

    /// Verbose output (repeat for more)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn print_table(title: &str, table: &[(u8, &str, &str)]) {
    let mut entries = table.to_vec();
    entries.sort_by(|a, b| a.1.cmp(b.1));
    println!("{title}:");
    for (_, short, long) in &entries {
        println!("\t{:<15}  {}", short, long);
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(path) = &cli.signing_info {
        config.signing_info = path.clone();
    }
    if let Some(secs) = cli.timeout {
        config.verification_timeout_secs = secs;
    }
    Ok(config)
}

fn required<'a, T>(value: &'a Option<T>, flag: &str) -> Result<&'a T> {
    value
        .as_ref()
        .ok_or_else(|| AvbSignError::Config(format!("missing required option {flag}")))
}

fn sign(cli: &Cli, config: &Config) -> Result<SigningReport> {
    let tree = AospTree::open(config, required(&cli.tree, "--tree")?, cli.revision.clone())?;
    let host_tools = HostTools::for_tree(config, &tree);
    let avbtool = AvbTool::for_tree(config, &tree, host_tools.clone());

    let request = SigningRequest {
        product: required(&cli.product, "--product")?.clone(),
        image_path: required(&cli.image, "--image")?.clone(),
        key_path: required(&cli.key, "--key")?.clone(),
        other_images_dir: required(&cli.other_images, "--other-images")?.clone(),
        output_dir: required(&cli.output, "--output")?.clone(),
    };

    let mut pipeline = SigningPipeline::new(config, &avbtool, &tree, &host_tools);
    pipeline.run(&request)
}

fn fail(e: AvbSignError) -> ! {
    eprintln!("avbsign: {e}");
    process::exit(e.exit_code());
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    if cli.list_algorithms {
        print_table("Hash algorithms", HashAlgorithm::table());
        print_table("Signing algorithms", SigningAlgorithm::table());
        process::exit(0);
    }

    let config = load_config(&cli).unwrap_or_else(|e| fail(e));

    // ---- List mode ----
    if let Some(image) = &cli.list {
        match SparseImageHeader::read(image, config.sparse_byte_order()) {
            Ok(header) => {
                if !cli.quiet {
                    print_sparse_info(image, &header);
                }
                process::exit(0);
            }
            Err(e) => {
                eprintln!("avbsign: {}: {}", image.display(), e);
                process::exit(e.exit_code());
            }
        }
    }

    // ---- Signing ----
    match sign(&cli, &config) {
        Ok(report) => {
            if !cli.quiet {
                println!("Partition Size: {} Bytes", report.partition_size);
                println!("Signed Image:   {}", report.signed_image.display());
                println!("VBMeta Image:   {}", report.vbmeta_image.display());
                for digest in &report.digests {
                    println!("Digest:         {}", digest.display());
                }
            }
        }
        Err(e) => fail(e),
    }
}
