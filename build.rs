//! Build script for zonewall
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! that the agent logs at start-up.

fn main() {
    println!("cargo:rerun-if-env-changed=ZONEWALL_NETNS_DIR");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
