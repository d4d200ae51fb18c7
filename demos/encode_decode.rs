use binschema::testsuite::json_to_value;
use binschema::Schema;
use clap::Parser as ClapParser;
use std::{fs, path::PathBuf};

/// binschema encode/decode round-trip example
#[derive(Debug, clap::Parser)]
struct Opts {
    /// The schema document, as JSON
    pub schema: PathBuf,

    /// The name of the root type to encode/decode
    pub root_type: String,

    /// A JSON value to encode as `root_type`
    pub value: PathBuf,
}

fn main() {
    tracing_subscriber::fmt::init();

    let opts = Opts::parse();

    let schema_str = fs::read_to_string(&opts.schema).unwrap();
    let schema = Schema::from_json(&schema_str).unwrap();

    let root_id = schema.validated().lookup(&opts.root_type).unwrap();
    let value_str = fs::read_to_string(&opts.value).unwrap();
    let value_json: serde_json::Value = serde_json::from_str(&value_str).unwrap();
    let value = json_to_value(schema.validated(), root_id, &value_json).unwrap();

    let encoded = schema.encode(&opts.root_type, &value).unwrap();
    println!("encoded {} bytes: {encoded:02x?}", encoded.len());

    let decoded = schema.decode(&opts.root_type, &encoded).unwrap();
    println!("decoded:\n{decoded:#?}");
}
