// Admin CLI: initialize the ledger database, seed demo data, and check
// the stored totals against the payment history.

use anyhow::Result;
use rust_decimal::Decimal;
use std::env;
use std::path::PathBuf;

use recruit_ledger::auth::{Principal, Role};
use recruit_ledger::{
    db, payments, Ledger, NewCandidate, NewPayment, PaymentMethod, PaymentType,
};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");

    match command {
        "init" => run_init(),
        "seed" => run_seed(),
        "verify" => run_verify(),
        _ => {
            println!("recruit-ledger {}", recruit_ledger::VERSION);
            println!();
            println!("Usage: recruit-ledger <command>");
            println!();
            println!("Commands:");
            println!("  init     Create the ledger database and schema");
            println!("  seed     Load a small demo dataset (no-op on a non-empty ledger)");
            println!("  verify   Recompute candidate totals from payment rows and report drift");
            Ok(())
        }
    }
}

fn database_path() -> PathBuf {
    env::var("DATABASE_PATH")
        .unwrap_or_else(|_| "recruitment.db".to_string())
        .into()
}

fn open_ledger() -> Result<Ledger> {
    let path = database_path();
    let ledger = Ledger::open(&path)?;
    println!("✓ Database opened: {:?}", path);
    Ok(ledger)
}

fn run_init() -> Result<()> {
    open_ledger()?;
    println!("✓ Database initialized with WAL mode");
    Ok(())
}

fn run_seed() -> Result<()> {
    let ledger = open_ledger()?;

    let existing = ledger.with_connection(db::count_candidates)?;
    if existing > 0 {
        println!("Ledger already contains {existing} candidates, nothing to do");
        return Ok(());
    }

    let demo_agent = 3;
    let rahim = ledger.with_connection(|conn| {
        db::insert_candidate(
            conn,
            &NewCandidate {
                agent_id: demo_agent,
                name: "Rahim Uddin".to_string(),
                passport_number: "A01234567".to_string(),
                phone: Some("01811000111".to_string()),
                email: Some("rahim@example.com".to_string()),
                package_amount: Decimal::from(450_000),
                status: "processing".to_string(),
            },
        )
    })?;
    let karim = ledger.with_connection(|conn| {
        db::insert_candidate(
            conn,
            &NewCandidate {
                agent_id: demo_agent,
                name: "Karim Ali".to_string(),
                passport_number: "B98765432".to_string(),
                phone: Some("01911000222".to_string()),
                email: Some("karim@example.com".to_string()),
                package_amount: Decimal::from(450_000),
                status: "medical_completed".to_string(),
            },
        )
    })?;

    // Payments go through the recorder so the seeded totals are real
    let admin = Principal::new(1, Role::SuperAdmin);
    let seed_payments = [
        (rahim, 50_000, PaymentType::Service, "Initial booking"),
        (karim, 100_000, PaymentType::Visa, "Visa processing fee"),
        (karim, 50_000, PaymentType::Medical, "Medical fee"),
    ];
    for (candidate_id, amount, payment_type, notes) in seed_payments {
        payments::record_payment(
            &ledger,
            &admin,
            &NewPayment {
                candidate_id,
                amount: Decimal::from(amount),
                payment_type,
                payment_method: PaymentMethod::Cash,
                transaction_id: None,
                notes: Some(notes.to_string()),
            },
        )?;
    }

    println!("✓ Seeded 2 demo candidates with 3 payments");
    Ok(())
}

fn run_verify() -> Result<()> {
    let ledger = open_ledger()?;

    let candidates = ledger.with_connection(db::count_candidates)?;
    let drift = ledger.with_connection(db::totals_drift)?;

    if drift.is_empty() {
        println!("✓ Ledger totals consistent for {candidates} candidates");
        return Ok(());
    }

    println!("Totals drift detected on {} of {candidates} candidates:", drift.len());
    for d in &drift {
        println!(
            "  #{} {}: stored paid {} vs computed {}, stored due {} vs expected {}",
            d.candidate_id,
            d.name,
            d.recorded_total,
            d.computed_total,
            d.recorded_due,
            d.expected_due,
        );
    }
    std::process::exit(1);
}
