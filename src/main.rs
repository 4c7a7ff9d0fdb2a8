use bgpipe::cli;
use bgpipe::stages::register_builtin_stages;

#[tokio::main(flavor = "multi_thread", worker_threads = 32)]
async fn main() {
    register_builtin_stages();

    let argv: Vec<String> = std::env::args().skip(1).collect();

    if argv.iter().any(|a| a == "--version") {
        cli::print_version();
        return;
    }
    if argv.iter().any(|a| a == "--list-stages") {
        cli::print_stage_words();
        return;
    }

    let code = cli::init_and_run(argv).await;
    std::process::exit(code);
}
