fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_dir = "proto";

    // Re-run codegen when the proto definition changes.
    println!("cargo:rerun-if-changed={}/transcoder.proto", proto_dir);

    tonic_build::configure()
        .build_server(true)
        .build_client(false) // We are the server
        .out_dir("src/generated")
        .compile(&[&format!("{}/transcoder.proto", proto_dir)], &[proto_dir])?;

    Ok(())
}
