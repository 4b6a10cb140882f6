use clap::Parser;
use std::sync::Arc;

use halocline::comm::CommBackend;
#[cfg(not(feature = "distributed"))]
use halocline::comm::SingleProcessComm;
use halocline::samples;
use halocline::Solution;

/// Distributed stencil execution engine: run a built-in sample solution.
#[derive(Parser)]
#[command(name = "halocline", version)]
struct Cli {
    /// Sample to run: "heat2d", "diffusion1d", or "smooth2d"
    #[arg(long, default_value = "heat2d")]
    stencil: String,

    /// Rank-domain size per domain dim
    #[arg(short = 'd', long, value_delimiter = ',', default_value = "128,128")]
    domain: Vec<i64>,

    /// Region size per domain dim (0 = whole rank)
    #[arg(short = 'r', long, value_delimiter = ',')]
    region: Option<Vec<i64>>,

    /// Block size per domain dim (0 = whole region)
    #[arg(short = 'b', long, value_delimiter = ',')]
    block: Option<Vec<i64>>,

    /// Time steps per region (wavefront depth)
    #[arg(long, default_value_t = 0)]
    region_steps: i64,

    /// Time steps per block (temporal-blocking depth)
    #[arg(long, default_value_t = 0)]
    block_steps: i64,

    /// Number of time steps to run
    #[arg(short = 't', long, default_value_t = 50)]
    steps: i64,

    /// Ranks per domain dim (requires the distributed build under mpirun)
    #[arg(long, value_delimiter = ',')]
    nranks: Option<Vec<i64>>,

    /// Overlap interior compute with halo exchange
    #[arg(long)]
    overlap: bool,

    /// Run the scalar reference path instead of the optimized path
    #[arg(long = "ref")]
    use_ref: bool,

    /// Print performance stats to stderr
    #[arg(long)]
    stats: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let def = match cli.stencil.as_str() {
        "heat2d" => samples::heat_2d(),
        "diffusion1d" => samples::diffusion_1d(),
        "smooth2d" => samples::smooth_2d_staged(),
        other => {
            eprintln!("Unknown stencil '{other}'");
            std::process::exit(1);
        }
    };
    let ndims = def.domain_dims.len();
    if cli.domain.len() != ndims {
        eprintln!(
            "Stencil '{}' has {ndims} domain dim(s), but -d gave {}",
            def.name,
            cli.domain.len()
        );
        std::process::exit(1);
    }

    #[cfg(feature = "distributed")]
    let (_universe, comm): (Option<mpi::environment::Universe>, Arc<dyn CommBackend>) = {
        let (universe, threading) =
            mpi::initialize_with_threading(mpi::Threading::Serialized).unwrap_or_else(|| {
                eprintln!("MPI initialization failed");
                std::process::exit(1);
            });
        if threading < mpi::Threading::Serialized {
            eprintln!("MPI_THREAD_SERIALIZED not provided");
            std::process::exit(1);
        }
        (Some(universe), Arc::new(halocline::comm::mpi::MpiComm::new()))
    };
    #[cfg(not(feature = "distributed"))]
    let comm: Arc<dyn CommBackend> = Arc::new(SingleProcessComm);

    let mut soln = Solution::new(def, comm).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    soln.settings.rank_sizes = cli.domain.clone();
    if let Some(r) = &cli.region {
        soln.settings.region_sizes = r.clone();
    }
    if let Some(b) = &cli.block {
        soln.settings.block_sizes = b.clone();
    }
    soln.settings.region_steps = cli.region_steps;
    soln.settings.block_steps = cli.block_steps;
    soln.settings.overlap_comms = cli.overlap;
    if let Some(nr) = &cli.nranks {
        soln.settings.nranks = nr.clone();
    }

    soln.prepare_solution().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    // A centered impulse gives the smoothers something to spread.
    let neigh = soln.neighborhood().expect("prepared");
    let center: Vec<i64> = (0..soln.def().ndims())
        .map(|d| neigh.overall_domain[d] / 2)
        .collect();
    soln.set_element(&soln.def().vars[0].name.clone(), &center, 0, 1.0)
        .unwrap_or_else(|e| {
            eprintln!("Error: {e}");
            std::process::exit(1);
        });

    let result = if cli.use_ref {
        soln.run_ref(0, cli.steps - 1)
    } else {
        soln.run_solution(0, cli.steps - 1)
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    let v = soln
        .get_element(&soln.def().vars[0].name.clone(), &center, cli.steps)
        .unwrap_or(None);
    println!(
        "{}: {} step(s) done, center value {:?}",
        soln.def().name,
        cli.steps,
        v
    );

    if cli.stats {
        soln.stats.display();
    }
    soln.end_solution();
}
