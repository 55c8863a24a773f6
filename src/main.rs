use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use roomsense_lib::{config::Settings, utils::logging};

#[derive(Parser, Debug)]
#[command(name = "roomsense", version, about = "Fingerprint storage and calibration service")]
struct Args {
    /// Directory holding one dataset per family
    #[arg(long = "data")]
    data_dir: Option<PathBuf>,

    /// Classifier address (host:port)
    #[arg(long)]
    classifier: Option<String>,

    /// JSON settings file
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    debug: bool,

    /// Print the SQL dump of a family and exit
    #[arg(long, value_name = "FAMILY")]
    dump: Option<String>,

    /// List stored families and exit
    #[arg(long)]
    families: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        settings.store.data_dir = dir;
    }
    if let Some(address) = args.classifier {
        settings.classifier.address = address;
    }
    settings.debug |= args.debug;
    logging::init(settings.debug);

    if let Some(family) = args.dump {
        print!("{}", roomsense_lib::dump_family(&settings.store.data_dir, &family)?);
        return Ok(());
    }

    if args.families {
        for family in roomsense_lib::list_families(&settings.store.data_dir)? {
            println!("{family}");
        }
        return Ok(());
    }

    roomsense_lib::serve(settings).await
}
