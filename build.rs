fn main() {
    // src/specs.toml is embedded by the spec registry; reject broken TOML at build time.
    println!("cargo:rerun-if-changed=src/specs.toml");
    let text = match std::fs::read_to_string("src/specs.toml") {
        Ok(t) => t,
        Err(e) => panic!("read src/specs.toml: {e}"),
    };
    if let Err(e) = text.parse::<toml::Table>() {
        panic!("src/specs.toml is not valid TOML: {e}");
    }
}
