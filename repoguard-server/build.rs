fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");
    println!("cargo:rerun-if-env-changed=REPOGUARD_GIT_HASH");
}
