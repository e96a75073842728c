use anyhow::Result;

fn main() -> Result<()> {
    let proto_root = "proto";

    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .protoc_arg("--experimental_allow_proto3_optional")
        .compile_protos(
            &[
                format!("{proto_root}/geyser/geyser.proto"),
                format!("{proto_root}/substreams/rpc.proto"),
                format!("{proto_root}/mirror/account_changes.proto"),
            ],
            &[proto_root],
        )?;
    Ok(())
}
