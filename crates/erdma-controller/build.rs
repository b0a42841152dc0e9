fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // kubelet device plugin: we serve DevicePlugin and call Registration
    tonic_build::configure().compile_protos(&["proto/deviceplugin.proto"], &["proto"])?;

    tonic_build::configure().build_server(false).compile_protos(
        &[
            "proto/pod_resources.proto",
            "proto/cri_v1.proto",
            "proto/cri_v1alpha2.proto",
        ],
        &["proto"],
    )?;
    Ok(())
}
