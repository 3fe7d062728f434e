/// Messages that are also persisted as JSON by the daemon.
const SERDE_MESSAGES: &[&str] = &[
    ".fleet.v1.SystemMetrics",
    ".fleet.v1.SystemProfile",
    ".fleet.v1.HardwareProfile",
    ".fleet.v1.DiskInfo",
    ".fleet.v1.NicInfo",
    ".fleet.v1.SoftwareInventory",
    ".fleet.v1.InstalledPackage",
    ".fleet.v1.ServiceInfo",
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/fleet/v1/fleet.proto");

    let mut builder = tonic_build::configure()
        .build_server(true)
        .build_client(true);
    for message in SERDE_MESSAGES {
        builder = builder
            .type_attribute(message, "#[derive(serde::Serialize, serde::Deserialize)]")
            .type_attribute(message, "#[serde(default)]");
    }
    builder.compile_protos(&["proto/fleet/v1/fleet.proto"], &["proto"])?;

    Ok(())
}
