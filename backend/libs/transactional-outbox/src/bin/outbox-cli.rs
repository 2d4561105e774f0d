use std::env;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use transactional_outbox::SqlxOutboxRepository;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage:");
        eprintln!("  outbox-cli replay-since <rfc3339_ts> <DATABASE_URL>");
        eprintln!("  outbox-cli replay-product <product_id> <DATABASE_URL>");
        std::process::exit(1);
    }

    let cmd = args[1].as_str();

    match cmd {
        "replay-since" if args.len() == 4 => {
            let ts: DateTime<Utc> = DateTime::parse_from_rfc3339(&args[2])?.with_timezone(&Utc);
            let repo = SqlxOutboxRepository::new(PgPool::connect(&args[3]).await?);
            let count = repo.replay_since(ts).await?;
            println!("Replayed {} events since {}", count, ts);
        }
        "replay-product" if args.len() == 4 => {
            let product_id: i64 = args[2].parse()?;
            let repo = SqlxOutboxRepository::new(PgPool::connect(&args[3]).await?);
            let count = repo.replay_aggregate("product", product_id).await?;
            println!("Replayed {} events for product {}", count, product_id);
        }
        _ => {
            eprintln!("Invalid arguments");
            std::process::exit(1);
        }
    }

    Ok(())
}
