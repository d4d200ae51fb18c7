use binschema::{Error, Schema};
use clap::Parser as ClapParser;
use std::{fs, path::PathBuf};
use tokio::fs::File;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::error;

/// binschema streaming-decode example, for a root type whose whole shape is
/// a single `length_prefixed_items` array field
#[derive(Debug, clap::Parser)]
struct Opts {
    /// The schema document, as JSON
    pub schema: PathBuf,

    /// The name of the root type to decode
    pub root_type: String,

    /// The binary file to decode
    pub input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let opts = Opts::parse();

    let schema_str = fs::read_to_string(&opts.schema).unwrap();
    let schema = Schema::from_json(&schema_str).unwrap();

    let stream = File::open(&opts.input).await.unwrap();
    let decoder = schema.decode_stream(&opts.root_type)?;
    let mut reader = FramedRead::new(stream, decoder);

    while let Some(value) = reader.next().await {
        let item = match value {
            Ok(v) => v,
            Err(e) => {
                error!("{e}");
                break;
            }
        };
        println!("{item:#?}");
    }

    Ok(())
}
