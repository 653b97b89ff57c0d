//! Build script for hostwall
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `hostwall --version`.

fn main() {
    // Re-run build if the default nft binary override changes
    println!("cargo:rerun-if-env-changed=HOSTWALL_NFT_COMMAND");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
