use topl_daml_bridge::config::{parse_or_exit, AliceArgs};
use topl_daml_bridge::logger;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    logger::init_tracing();
    let args = parse_or_exit::<AliceArgs>();

    if let Err(e) = topl_daml_bridge::run_alice(args).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
