use trackload::prelude::*;

fn main() {
    let exit_code = match Simulation::initialize().and_then(|simulation| simulation.execute()) {
        Ok(report) => report.exit_code(),
        Err(e) => {
            eprintln!("{}", e);
            1
        }
    };
    std::process::exit(exit_code);
}
