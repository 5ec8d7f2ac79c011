//! On-disk round-trip behavior of the ordered catalog.

mod common;

use mcp_fleet::config::{Catalog, BASE_PORT};

const ORDERED: &str = r#"{"servers":{"zebra":{"command":"echo z"},"alpha":{"command":"echo a"},"beta":{"command":"echo b"}}}"#;

#[test]
fn load_save_load_preserves_order_and_ports() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcp.json");
    std::fs::write(&path, ORDERED).unwrap();

    let catalog = Catalog::load(&path).unwrap();
    assert_eq!(catalog.server_order, vec!["zebra", "alpha", "beta"]);
    assert_eq!(catalog.servers["zebra"].port, Some(BASE_PORT));
    assert_eq!(catalog.servers["beta"].port, Some(BASE_PORT + 2));

    catalog.save(&path).unwrap();
    let reloaded = Catalog::load(&path).unwrap();
    assert_eq!(reloaded.server_order, catalog.server_order);
    assert_eq!(reloaded.servers, catalog.servers);
}

#[test]
fn second_save_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcp.json");
    std::fs::write(&path, ORDERED).unwrap();

    Catalog::load(&path).unwrap().save(&path).unwrap();
    let first = std::fs::read_to_string(&path).unwrap();

    Catalog::load(&path).unwrap().save(&path).unwrap();
    let second = std::fs::read_to_string(&path).unwrap();

    assert_eq!(first, second);
}

#[test]
fn pretty_output_is_two_space_indented() {
    let catalog = Catalog::parse(ORDERED).unwrap();
    let json = catalog.to_json().unwrap();
    assert!(json.starts_with("{\n  \"servers\": {\n"));
    assert!(json.contains("\n    \"zebra\": {"));
    assert!(json.ends_with("  }\n}"));
}
