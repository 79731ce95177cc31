use std::error::Error;
use std::path::Path;
use std::process::exit;

use clap::Parser;
use rusqlite::Connection;
use rust_decimal::Decimal;
use time::{Duration, OffsetDateTime};

use fintrack_rs::{
    AppState, CategoryKind, Config, Interval, NewAccount, NewCategory, NewSaving, NewSubscription,
    UserId, create_account, create_saving,
};

/// A utility for creating a test database for fintrack_rs.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// File path to save the SQLite database to.
    #[arg(long, short)]
    output_path: String,

    /// The user that owns the demo records.
    #[arg(long, default_value = "demo")]
    owner: String,
}

/// Create and populate a database for manual testing.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let output_path = Path::new(&args.output_path);

    match output_path.extension() {
        None => {
            eprintln!("Output path must include a file extension (e.g., 'my_database.db').");
            exit(1);
        }
        Some(extension) if extension.is_empty() => {
            eprintln!("Output path must include a file extension (e.g., 'my_database.db').");
            exit(1);
        }
        _ => {}
    }

    if output_path.is_file() {
        eprintln!("File already exists at {output_path:#?}!");
        exit(1);
    }

    println!("Creating database at {output_path:#?}");
    let state = AppState::new(Connection::open(output_path)?, Config::default())?;
    let owner = UserId::new(args.owner);
    let now = OffsetDateTime::now_utc();

    println!("Creating test account and saving...");
    let account = {
        let connection = state
            .database
            .connection()
            .lock()
            .map_err(|error| error.to_string())?;

        create_saving(
            NewSaving::new(
                owner.clone(),
                "Holiday",
                Decimal::new(250, 0),
                Decimal::new(2000, 0),
            ),
            &connection,
            now,
        )?;

        create_account(
            NewAccount::new(owner.clone(), "Everyday", Decimal::new(1500, 0)),
            &connection,
            now,
        )?
    };

    println!("Creating test categories...");
    state
        .categories
        .create(NewCategory::new(owner.clone(), CategoryKind::Income, "Salary").icon("briefcase"))
        .await?;
    let entertainment = state
        .categories
        .create(
            NewCategory::new(owner.clone(), CategoryKind::Expense, "Entertainment")
                .icon("film")
                .budget(Decimal::new(50, 0)),
        )
        .await?;

    println!("Creating test subscription...");
    let catch_up = state
        .scheduler
        .create_subscription(
            NewSubscription::new(
                owner,
                "Streaming",
                Decimal::new(1599, 2),
                account.id,
                entertainment.id,
                now - Duration::days(65),
                Interval::Month,
            )
            .remind_before(3),
        )
        .await?;

    println!(
        "Recorded {} past payments, next payment due {}",
        catch_up.materialized, catch_up.subscription.next_active
    );
    println!("Success!");

    Ok(())
}
