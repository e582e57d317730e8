fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/lcm/v1/lcm.proto");
    println!("cargo:rerun-if-changed=proto/trainer/v1/trainer.proto");

    // The lifecycle service is served here, the trainer is only ever called.
    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .format(true)
        .compile(&["proto/lcm/v1/lcm.proto"], &["proto/lcm/v1"])?;

    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .format(true)
        .compile(&["proto/trainer/v1/trainer.proto"], &["proto/trainer/v1"])?;
    Ok(())
}
