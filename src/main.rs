//! multiget - application entry point.

use clap::Parser;
use multiget::config::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    multiget::init_tracing(cli.verbose, cli.json_log);

    let servers: Vec<(String, u16)> = cli.servers.iter().map(|s| Cli::mirror_addr(s)).collect();

    let result = multiget::bootstrap::run(&cli.target, &servers, &cli.output).await;

    match result {
        Ok(outcome) => {
            println!("length:   {}", outcome.length);
            println!("duration: {:.3}s", outcome.elapsed.as_secs_f64());
            println!("sha256:   {}", outcome.sha256_hex);

            if cli.plot {
                let plot_path = cli.output.with_extension("gnuplot");
                if let Err(e) = multiget::plot::write_script(&plot_path, servers.len()) {
                    eprintln!("warning: failed to write plot script: {e}");
                }
            }
        }
        Err(e) => {
            eprintln!("multiget: {e}");
            std::process::exit(e.exit_code());
        }
    }
}
