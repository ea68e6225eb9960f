// The command-line orchestrator. Loads one delimited table, hands it to the
// decomposition engine, drives the requested aggregation, and prints (and
// optionally persists) the resulting tables. All statistics live in the
// library; this file only parses arguments and formats output.

use clap::{Parser, Subcommand};
use kollabi::aggregate::{FeatureTable, PairwiseTable};
use kollabi::engine::Decomposition;
use kollabi::gam::PolyGamFactory;
use kollabi::{CollabExplainer, Dataset};
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[clap(
    name = "kollabi",
    version,
    about = "Decomposes explained target variance into additive and interactive feature-group collaboration."
)]
struct Cli {
    /// Input table: delimited text with a header row, numeric columns only.
    #[clap(long)]
    input: PathBuf,

    /// Name of the target column.
    #[clap(long)]
    target: String,

    /// Fraction of rows held out as the evaluation partition.
    #[clap(long, default_value_t = 0.2)]
    test_size: f64,

    /// Seed for the train/evaluation shuffle; omit for a random split.
    #[clap(long)]
    seed: Option<u64>,

    /// Field separator of the input file (a single ASCII character).
    #[clap(long, default_value = ",", value_parser = parse_separator)]
    separator: u8,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decompose every feature pair.
    Pairwise {
        /// Also write the results table to this path as delimited text.
        #[clap(long)]
        output: Option<PathBuf>,
    },
    /// Decompose each feature (or one given feature) against all the rest.
    OneVsRest {
        #[clap(long)]
        feature: Option<String>,
    },
    /// Pairwise decompositions with one fixed feature, each conditioned on
    /// everything else.
    PairsVsRest {
        #[clap(long)]
        feature: String,
    },
}

fn parse_separator(s: &str) -> Result<u8, String> {
    match s.as_bytes() {
        [b] => Ok(*b),
        _ => Err(format!(
            "'{s}' is not a single ASCII character; use e.g. ',' ';' or '\\t'"
        )),
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let dataset = Dataset::from_csv(&cli.input, &cli.target, cli.separator)?;
    log::info!(
        "Loaded {} rows, {} features (target '{}')",
        dataset.n_rows(),
        dataset.feature_names().len(),
        dataset.target_name()
    );
    let mut explainer = CollabExplainer::new(
        dataset,
        Box::new(PolyGamFactory::default()),
        cli.test_size,
        cli.seed,
    )?;

    match cli.command {
        Command::Pairwise { output } => {
            let table = explainer.get_all_pairwise(false)?;
            print_pairwise(&table);
            if let Some(path) = output {
                table.save(&path)?;
                println!("\nWrote {} rows to '{}'", table.rows.len(), path.display());
            }
        }
        Command::OneVsRest { feature: Some(f) } => {
            let res = explainer.get_one_vs_rest(&f)?;
            print_field_header("feature");
            print_result_row(&f, &res);
        }
        Command::OneVsRest { feature: None } => {
            let table = explainer.get_all_one_vs_rest()?;
            print_feature_table(&table);
        }
        Command::PairsVsRest { feature } => {
            let table = explainer.get_pairs_vs_rest(&feature)?;
            print_feature_table(&table);
        }
    }
    Ok(())
}

fn print_field_header(index_label: &str) {
    print!("{index_label:<24}");
    for name in Decomposition::FIELD_NAMES {
        print!("{name:>24}");
    }
    println!();
}

fn print_result_row(label: &str, res: &Decomposition) {
    print!("{label:<24}");
    for v in res.values() {
        print!("{v:>24.6}");
    }
    println!();
}

fn print_pairwise(table: &PairwiseTable) {
    print_field_header("feature1, feature2");
    for row in &table.rows {
        print_result_row(&format!("{}, {}", row.feature1, row.feature2), &row.result);
    }
}

fn print_feature_table(table: &FeatureTable) {
    print_field_header("feature");
    for (feature, res) in &table.rows {
        print_result_row(feature, res);
    }
}
