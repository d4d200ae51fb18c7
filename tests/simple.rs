use binschema::testsuite::{run_bundle, TestBundle};
use pretty_assertions::assert_eq;
use test_log::test;

fn load(path: &str) -> TestBundle {
    let raw = std::fs::read_to_string(path).unwrap();
    serde_json::from_str(&raw).unwrap()
}

fn run(path: &str) {
    let bundle = load(path);
    let results = run_bundle(&bundle);
    let failures: Vec<String> = results
        .into_iter()
        .filter_map(|(name, result)| result.err().map(|e| format!("{name}: {e}")))
        .collect();
    assert_eq!(failures, Vec::<String>::new(), "bundle '{}' had failing cases", bundle.name);
}

#[test]
fn point_fixed_struct() {
    run("test_resources/fixtures/simple/point.json");
}

#[test]
fn optional_id_presence_flag() {
    run("test_resources/fixtures/simple/optional.json");
}

#[test]
fn alignment_padding_to_word_boundary() {
    run("test_resources/fixtures/simple/alignment.json");
}
