use anyhow::{bail, Context, Result};
use std::env;
use std::fs;
use std::path::Path;

// Use library instead of local modules
use expense_tracker::{
    categorize, detect_anomalies, export_csv, forecast_next_month, import_csv, list_expenses,
    list_expenses_by_category, open_database, personalized_summary, Categorizer, Config,
};

const USAGE: &str = "\
Usage: expense-tracker <command> [args]

Commands:
  import <file.csv>       Import expenses from a CSV file
  export [file.csv]       Export all expenses (stdout when no file is given)
  list                    List all expenses
  summary                 Total spent and top category
  anomalies               Expenses far from the mean amount
  forecast <category>     Next month's forecast for a category
  categorize <title...>   Predict a category with the loaded model

Configuration is read from the environment (.env supported):
  EXPENSE_DB_PATH, EXPENSE_MODEL_PATH, LOG_LEVEL, LOG_FORMAT";

fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    config.logging.init();

    let args: Vec<String> = env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("help");

    match command {
        "import" => {
            let path = args.get(1).context("import requires a CSV file path")?;
            run_import(&config, Path::new(path))
        }
        "export" => run_export(&config, args.get(1).map(Path::new)),
        "list" => run_list(&config),
        "summary" => run_summary(&config),
        "anomalies" => run_anomalies(&config),
        "forecast" => {
            let category = args.get(1).context("forecast requires a category")?;
            run_forecast(&config, category)
        }
        "categorize" => {
            if args.len() < 2 {
                bail!("categorize requires a title");
            }
            run_categorize(&config, &args[1..].join(" "))
        }
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}\n", other);
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

fn run_import(config: &Config, csv_path: &Path) -> Result<()> {
    let bytes = fs::read(csv_path).with_context(|| format!("Failed to read {:?}", csv_path))?;
    let conn = open_database(&config.db_path)?;

    let summary = import_csv(&conn, &bytes)
        .with_context(|| format!("Failed to import {:?}", csv_path))?;

    println!("Imported: {} expenses", summary.imported);
    if summary.skipped > 0 {
        println!("Skipped:  {} rows (missing field or zero amount)", summary.skipped);
    }
    Ok(())
}

fn run_export(config: &Config, out: Option<&Path>) -> Result<()> {
    let conn = open_database(&config.db_path)?;
    let bytes = export_csv(&conn)?;

    match out {
        Some(path) => {
            fs::write(path, &bytes).with_context(|| format!("Failed to write {:?}", path))?;
            println!("Exported to {:?}", path);
        }
        None => print!("{}", String::from_utf8_lossy(&bytes)),
    }
    Ok(())
}

fn run_list(config: &Config) -> Result<()> {
    let conn = open_database(&config.db_path)?;
    let expenses = list_expenses(&conn)?;

    for e in &expenses {
        println!(
            "{:>5}  {}  {:<30}  {:>10.2}  {}",
            e.id,
            e.created_at.format("%Y-%m-%d"),
            e.title,
            e.amount,
            e.category
        );
    }
    println!("{} expenses", expenses.len());
    Ok(())
}

fn run_summary(config: &Config) -> Result<()> {
    let conn = open_database(&config.db_path)?;
    let summary = personalized_summary(&list_expenses(&conn)?);

    println!("Total spent:  {:.2}", summary.total_spent);
    if summary.top_category.is_empty() {
        println!("Top category: (none)");
    } else {
        println!(
            "Top category: {} ({:.2})",
            summary.top_category, summary.top_category_amount
        );
    }
    Ok(())
}

fn run_anomalies(config: &Config) -> Result<()> {
    let conn = open_database(&config.db_path)?;
    let anomalies = detect_anomalies(&list_expenses(&conn)?);

    if anomalies.is_empty() {
        println!("No anomalies found");
    }
    for a in &anomalies {
        println!("{:>5}  {:<30}  {:>10.2}", a.id, a.title, a.amount);
    }
    Ok(())
}

fn run_forecast(config: &Config, category: &str) -> Result<()> {
    let conn = open_database(&config.db_path)?;
    let forecast = forecast_next_month(&list_expenses_by_category(&conn, category)?);

    println!("Forecast for {}: {:.2}", category, forecast);
    Ok(())
}

fn run_categorize(config: &Config, title: &str) -> Result<()> {
    let model = Categorizer::load_optional(&config.model_path);
    let category = categorize(model.as_ref(), title)
        .with_context(|| format!("Model artifact: {:?}", config.model_path))?;

    println!("{}", category);
    Ok(())
}
