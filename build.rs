fn main() {
    // Built-in server definitions are embedded with include_dir! from registry/
    println!("cargo:rerun-if-changed=registry/");
}
