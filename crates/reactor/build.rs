fn main() {
    if std::env::var_os("PROTOC").is_none() {
        unsafe {
            std::env::set_var(
                "PROTOC",
                protoc_bin_vendored::protoc_bin_path().expect("vendored protoc not available"),
            );
        }
    }
    let mut config = prost_build::Config::new();
    config.bytes(["."]);
    config
        .compile_protos(&["proto/sync.proto"], &["proto/"])
        .expect("Failed to compile protobuf definitions");
}
