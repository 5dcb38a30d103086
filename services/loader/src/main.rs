//! Loader Service - Loads delimited billing exports into the normalized schema
//!
//! Responsibilities:
//! - Read a delimited export of customers, invoices and transactions
//! - Coalesce bilingual column labels into canonical fields
//! - Deduplicate entities by their natural keys (first occurrence wins)
//! - Persist the batch in foreign-key dependency order
//! - Wire datastore-generated surrogate keys into dependent rows
//!
//! CRITICAL: The batch is ATOMIC
//! Either every entity from a run becomes visible or none of it does.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use clap::Parser;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use tokio::fs;

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads delimited billing exports into the database")]
struct Args {
    /// Path to the delimited export file
    #[arg(long)]
    file: String,

    /// Dry run - parse and reconcile, don't touch the database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

// =============================================================================
// Date normalization
// =============================================================================

/// Timestamp patterns tried in order against incoming text.
const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
];

/// Date-only fallbacks for the same patterns.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"];

/// Parse free-text timestamps from the export.
///
/// Tries the known patterns first, then a generic RFC 3339 parse, then the
/// date-only forms at midnight. Malformed or missing values degrade to the
/// current time instead of failing the row.
fn parse_date_time(value: Option<&str>) -> NaiveDateTime {
    let Some(text) = value else {
        return Utc::now().naive_utc();
    };

    for format in DATE_TIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return parsed;
        }
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return parsed.naive_utc();
    }

    for format in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(text, format) {
            return parsed.and_time(NaiveTime::MIN);
        }
    }

    Utc::now().naive_utc()
}

// =============================================================================
// Row mapping - bilingual column labels
// =============================================================================

/// One raw row from the export: header label to cell text.
type RawRow = HashMap<String, String>;

/// Look up a field by its localized label, falling back to the snake_case
/// machine label. Empty cells count as absent.
fn field<'a>(row: &'a RawRow, localized: &str, machine: &str) -> Option<&'a str> {
    row.get(localized)
        .or_else(|| row.get(machine))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

/// Parse an amount field, defaulting to zero when absent or malformed.
fn parse_amount(value: Option<&str>) -> f64 {
    value.and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0)
}

// =============================================================================
// Entities keyed by natural business keys
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Customer {
    identification_number: String,
    name: String,
    address: String,
    phone: String,
    email: String,
}

#[derive(Debug, Clone, PartialEq)]
struct Invoice {
    number: String,
    period: String,
    invoiced_amount: f64,
    amount_paid: f64,
    /// Identification number seen on the same row, links the customer later.
    customer_identification: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct Transaction {
    external_id: String,
    occurred_at: NaiveDateTime,
    amount: f64,
    kind: String,
    state: String,
    platform: String,
    /// Invoice number seen on the same row, links the invoice later.
    invoice_number: Option<String>,
}

// =============================================================================
// Batch reconciliation - first occurrence wins
// =============================================================================

/// Deduplicated entity collections for one ingestion run.
///
/// The `Vec`s hold entities in discovery order; the `seen_*` sets guard the
/// natural keys so later duplicate rows are ignored, not merged. State and
/// platform names are plain deduplicated sets.
#[derive(Debug, Default)]
struct Batch {
    customers: Vec<Customer>,
    invoices: Vec<Invoice>,
    transactions: Vec<Transaction>,
    states: BTreeSet<String>,
    platforms: BTreeSet<String>,
    seen_customers: HashSet<String>,
    seen_invoices: HashSet<String>,
    seen_transactions: HashSet<String>,
}

impl Batch {
    /// Absorb one raw row into the accumulators.
    ///
    /// A row missing an identification number, invoice number or transaction
    /// id simply contributes no entity of that kind.
    fn absorb(&mut self, row: &RawRow) {
        let customer_id = field(row, "Número de Identificación", "identification_number");

        if let Some(id) = customer_id {
            if self.seen_customers.insert(id.to_string()) {
                self.customers.push(Customer {
                    identification_number: id.to_string(),
                    name: field(row, "Nombre del Cliente", "customer_name")
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("Customer {}", id)),
                    address: field(row, "Dirección", "address")
                        .unwrap_or("N/A")
                        .to_string(),
                    phone: field(row, "Teléfono", "phone").unwrap_or("N/A").to_string(),
                    email: field(row, "Correo Electrónico", "email")
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("customer{}@example.com", id)),
                });
            }
        }

        let invoice_number = field(row, "Número de Factura", "invoice_number");

        if let Some(number) = invoice_number {
            if self.seen_invoices.insert(number.to_string()) {
                self.invoices.push(Invoice {
                    number: number.to_string(),
                    period: field(row, "Periodo de Facturación", "invoice_period")
                        .unwrap_or("N/A")
                        .to_string(),
                    invoiced_amount: parse_amount(field(row, "Monto Facturado", "invoiced_amount")),
                    amount_paid: parse_amount(field(row, "Monto Pagado", "amount_paid")),
                    customer_identification: customer_id.map(str::to_string),
                });
            }
        }

        if let Some(external_id) = field(row, "ID de la Transacción", "transaction_id") {
            let state = field(row, "Estado de la Transacción", "transaction_state")
                .unwrap_or("Pendiente");
            let platform = field(row, "Plataforma Utilizada", "platform").unwrap_or("Unknown");

            // Observed on every transaction-carrying row, duplicates included.
            self.states.insert(state.to_string());
            self.platforms.insert(platform.to_string());

            if self.seen_transactions.insert(external_id.to_string()) {
                self.transactions.push(Transaction {
                    external_id: external_id.to_string(),
                    occurred_at: parse_date_time(field(
                        row,
                        "Fecha y Hora de la Transacción",
                        "transaction_date",
                    )),
                    amount: parse_amount(field(
                        row,
                        "Monto de la Transacción",
                        "transaction_amount",
                    )),
                    kind: field(row, "Tipo de Transacción", "transaction_type")
                        .unwrap_or("Pago")
                        .to_string(),
                    state: state.to_string(),
                    platform: platform.to_string(),
                    invoice_number: invoice_number.map(str::to_string),
                });
            }
        }
    }
}

// =============================================================================
// Export parsing
// =============================================================================

/// Decode raw export bytes. Exports saved by spreadsheet tools are often
/// Windows-1252 rather than UTF-8.
fn decode_export(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(content) => content,
        Err(err) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(err.as_bytes());
            decoded.into_owned()
        }
    }
}

/// Parse the delimited export into a reconciled batch.
///
/// Rows the CSV layer cannot read are skipped with a warning and never abort
/// the pass.
fn parse_export(content: &str) -> Result<Batch> {
    // Remove UTF-8 BOM if present
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut batch = Batch::default();
    let mut absorbed = 0usize;
    let mut skipped = 0usize;

    for (line_idx, result) in reader.deserialize().enumerate() {
        let row: RawRow = match result {
            Ok(row) => row,
            Err(e) => {
                eprintln!("Warning: skipping line {} due to error: {}", line_idx + 2, e);
                skipped += 1;
                continue;
            }
        };
        batch.absorb(&row);
        absorbed += 1;
    }

    println!("Absorbed {} rows, skipped {}", absorbed, skipped);
    Ok(batch)
}

// =============================================================================
// Dependency-ordered persistence
// =============================================================================

/// Entity counts from one completed run.
#[derive(Debug, Default, PartialEq, Serialize)]
struct LoadSummary {
    customers: usize,
    invoices: usize,
    transactions: usize,
    platforms: usize,
    states: usize,
}

impl LoadSummary {
    fn of(batch: &Batch) -> Self {
        Self {
            customers: batch.customers.len(),
            invoices: batch.invoices.len(),
            transactions: batch.transactions.len(),
            platforms: batch.platforms.len(),
            states: batch.states.len(),
        }
    }
}

/// Persist the whole batch inside one transaction.
///
/// Insertion order follows the foreign keys: states and platforms first,
/// then transactions, then invoices, then customers. Any failure rolls the
/// run back in full.
async fn insert_batch(pool: &PgPool, batch: &Batch) -> Result<LoadSummary> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    match insert_all(&mut tx, batch).await {
        Ok(summary) => {
            tx.commit().await.context("Failed to commit transaction")?;
            Ok(summary)
        }
        Err(e) => {
            tx.rollback().await.ok();
            Err(e)
        }
    }
}

async fn insert_all(conn: &mut PgConnection, batch: &Batch) -> Result<LoadSummary> {
    // Shared lookup tables, seeded idempotently.
    for state in &batch.states {
        sqlx::query("INSERT INTO states (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(state)
            .execute(&mut *conn)
            .await
            .context("Failed to insert states")?;
    }
    for platform in &batch.platforms {
        sqlx::query("INSERT INTO platforms (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(platform)
            .execute(&mut *conn)
            .await
            .context("Failed to insert platforms")?;
    }

    // Re-read both tables: DO NOTHING returns no id for rows that already
    // existed, so the select is the only complete source of the lookups.
    let state_rows: Vec<(i64, String)> = sqlx::query_as("SELECT state_id, name FROM states")
        .fetch_all(&mut *conn)
        .await
        .context("Failed to load state lookup")?;
    let state_ids: HashMap<String, i64> =
        state_rows.into_iter().map(|(id, name)| (name, id)).collect();

    let platform_rows: Vec<(i64, String)> =
        sqlx::query_as("SELECT platform_id, name FROM platforms")
            .fetch_all(&mut *conn)
            .await
            .context("Failed to load platform lookup")?;
    let platform_ids: HashMap<String, i64> = platform_rows
        .into_iter()
        .map(|(id, name)| (name, id))
        .collect();

    // Transactions in discovery order. The first transaction naming an
    // invoice number wins that invoice's linkage.
    let mut invoice_links: HashMap<String, i64> = HashMap::new();
    for transaction in &batch.transactions {
        let state_id: Option<i64> = state_ids.get(&transaction.state).copied();

        let (transaction_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO transactions (external_id, occurred_at, amount, kind, state_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING transaction_id
            "#,
        )
        .bind(&transaction.external_id)
        .bind(transaction.occurred_at)
        .bind(transaction.amount)
        .bind(&transaction.kind)
        .bind(state_id)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to insert transactions")?;

        if let Some(&platform_id) = platform_ids.get(&transaction.platform) {
            sqlx::query(
                "INSERT INTO transaction_platforms (transaction_id, platform_id) VALUES ($1, $2)",
            )
            .bind(transaction_id)
            .bind(platform_id)
            .execute(&mut *conn)
            .await
            .context("Failed to insert transaction platforms")?;
        }

        if let Some(number) = &transaction.invoice_number {
            invoice_links.entry(number.clone()).or_insert(transaction_id);
        }
    }

    // Invoices next; the first invoice naming an identification number wins
    // that customer's linkage.
    let mut customer_links: HashMap<String, i64> = HashMap::new();
    for invoice in &batch.invoices {
        let transaction_id: Option<i64> = invoice_links.get(&invoice.number).copied();

        let (invoice_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO invoices (number, period, invoiced_amount, amount_paid, transaction_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING invoice_id
            "#,
        )
        .bind(&invoice.number)
        .bind(&invoice.period)
        .bind(invoice.invoiced_amount)
        .bind(invoice.amount_paid)
        .bind(transaction_id)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to insert invoices")?;

        if let Some(identification) = &invoice.customer_identification {
            customer_links.entry(identification.clone()).or_insert(invoice_id);
        }
    }

    for customer in &batch.customers {
        let invoice_id: Option<i64> =
            customer_links.get(&customer.identification_number).copied();

        sqlx::query(
            r#"
            INSERT INTO customers (identification_number, name, address, phone, email, invoice_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&customer.identification_number)
        .bind(&customer.name)
        .bind(&customer.address)
        .bind(&customer.phone)
        .bind(&customer.email)
        .bind(invoice_id)
        .execute(&mut *conn)
        .await
        .context("Failed to insert customers")?;
    }

    Ok(LoadSummary::of(batch))
}

// =============================================================================
// Driver
// =============================================================================

/// Read, decode and reconcile the export file.
async fn reconcile_file(file: &str) -> Result<Batch> {
    if !Path::new(file).exists() {
        anyhow::bail!("Export file not found: {}", file);
    }

    let bytes = fs::read(file).await.context("Failed to read export file")?;
    println!("Content size: {} bytes", bytes.len());

    let batch = parse_export(&decode_export(bytes))?;

    println!("\nReconciled entities:");
    println!("  Customers:    {}", batch.customers.len());
    println!("  Invoices:     {}", batch.invoices.len());
    println!("  Transactions: {}", batch.transactions.len());
    println!("  Platforms:    {}", batch.platforms.len());
    println!("  States:       {}", batch.states.len());

    Ok(batch)
}

/// Run the full pipeline against the database.
async fn run(pool: &PgPool, file: &str) -> Result<LoadSummary> {
    let batch = reconcile_file(file).await?;

    println!("\nStarting database insertion...");
    let summary = insert_batch(pool, &batch).await?;
    println!("All entities inserted");

    Ok(summary)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== Billing Export Loader ===");
    println!("File: {}", args.file);
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    if args.dry_run {
        let batch = reconcile_file(&args.file).await?;
        println!("\nDry run - nothing written to the database");
        println!(
            "Summary: {}",
            serde_json::to_string(&LoadSummary::of(&batch))?
        );
        return Ok(());
    }

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    let summary = run(&pool, &args.file).await?;

    println!("\n=== Load Complete ===");
    println!("Customers:    {}", summary.customers);
    println!("Invoices:     {}", summary.invoices);
    println!("Transactions: {}", summary.transactions);
    println!("Platforms:    {}", summary.platforms);
    println!("States:       {}", summary.states);
    println!("Summary: {}", serde_json::to_string(&summary)?);

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
