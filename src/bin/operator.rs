use topl_daml_bridge::config::{parse_or_exit, OperatorArgs};
use topl_daml_bridge::logger;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    logger::init_tracing();
    let args = parse_or_exit::<OperatorArgs>();

    if let Err(e) = topl_daml_bridge::run_operator(args).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
