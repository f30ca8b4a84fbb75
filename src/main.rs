use idplane::cli;

#[tokio::main]
async fn main() {
    let code = cli::run_cli().await;
    if code != 0 {
        std::process::exit(code);
    }
}
