use topl_daml_bridge::config::{parse_or_exit, AssetOperatorArgs};
use topl_daml_bridge::logger;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    logger::init_tracing();
    let args = parse_or_exit::<AssetOperatorArgs>();

    if let Err(e) = topl_daml_bridge::run_asset_operator(args).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
