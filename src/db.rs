use anyhow::Context;
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::aggregate;
use crate::config::DashboardConfig;
use crate::models::{
    DailyRecord, DefectRow, HistoricalRate, ProductionScope, QueryWindow, WeekRange,
    FINAL_ASSEMBLY_TYPE_ID,
};

pub async fn connect(config: &DashboardConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;
    debug!(max_connections = config.max_connections, "connection pool ready");
    Ok(pool)
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Day key stored in `dates.id`: `YYYYMMDD`, so lower keys are earlier days.
pub fn date_key(date: NaiveDate) -> i32 {
    date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32
}

/// Week key stored in `dates.week_num`: ISO year * 100 + ISO week.
pub fn week_key(date: NaiveDate) -> i32 {
    let iso = date.iso_week();
    iso.year() * 100 + iso.week() as i32
}

struct ProductionEntry<'a> {
    record_date: NaiveDate,
    model: &'a str,
    production_type_id: i32,
    input: i64,
    output: i64,
    source_key: String,
}

struct DefectEntry<'a> {
    record_date: NaiveDate,
    model: &'a str,
    production_type_id: i32,
    defect: &'a str,
    quantity: i64,
    source_key: String,
}

async fn upsert_date(pool: &PgPool, record_date: NaiveDate) -> anyhow::Result<i32> {
    let id: i32 = sqlx::query(
        r#"
        INSERT INTO production_dashboard.dates (id, record_date, week_num)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO UPDATE SET week_num = EXCLUDED.week_num
        RETURNING id
        "#,
    )
    .bind(date_key(record_date))
    .bind(record_date)
    .bind(week_key(record_date))
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

async fn upsert_model(pool: &PgPool, full_name: &str) -> anyhow::Result<i32> {
    let id: i32 = sqlx::query(
        r#"
        INSERT INTO production_dashboard.models (full_name)
        VALUES ($1)
        ON CONFLICT (full_name) DO UPDATE SET full_name = EXCLUDED.full_name
        RETURNING id
        "#,
    )
    .bind(full_name)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

async fn upsert_defect(pool: &PgPool, defect_name: &str, production_type_id: i32) -> anyhow::Result<i32> {
    let id: i32 = sqlx::query(
        r#"
        INSERT INTO production_dashboard.defects (defect_name, pd_type_id)
        VALUES ($1, $2)
        ON CONFLICT (defect_name, pd_type_id) DO UPDATE SET defect_name = EXCLUDED.defect_name
        RETURNING id
        "#,
    )
    .bind(defect_name)
    .bind(production_type_id)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

async fn insert_production(pool: &PgPool, entry: &ProductionEntry<'_>) -> anyhow::Result<bool> {
    anyhow::ensure!(
        entry.input >= 0 && entry.output >= 0,
        "negative production counts for {} on {}",
        entry.model,
        entry.record_date
    );
    let date_id = upsert_date(pool, entry.record_date).await?;
    let model_id = upsert_model(pool, entry.model).await?;

    let result = sqlx::query(
        r#"
        INSERT INTO production_dashboard.daily_production
        (id, date_id, model_id, pd_type_id, pd_input, pd_output, source_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(date_id)
    .bind(model_id)
    .bind(entry.production_type_id)
    .bind(entry.input)
    .bind(entry.output)
    .bind(&entry.source_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn insert_defect(pool: &PgPool, entry: &DefectEntry<'_>) -> anyhow::Result<bool> {
    anyhow::ensure!(
        entry.quantity >= 0,
        "negative quantity for defect '{}' on {}",
        entry.defect,
        entry.record_date
    );
    let date_id = upsert_date(pool, entry.record_date).await?;
    let model_id = upsert_model(pool, entry.model).await?;
    let defect_id = upsert_defect(pool, entry.defect, entry.production_type_id).await?;

    let result = sqlx::query(
        r#"
        INSERT INTO production_dashboard.daily_defects
        (id, date_id, model_id, defect_id, qty, source_key)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(date_id)
    .bind(model_id)
    .bind(defect_id)
    .bind(entry.quantity)
    .bind(&entry.source_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Loads two working weeks of production for both scopes.
pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    const SMT_TYPE_ID: i32 = 1;
    let models = [("JR-100", 1_200_i64), ("JR-220", 800_i64)];
    let assembly_defects = [
        ("solder bridge", 7_i64),
        ("missing screw", 4),
        ("scratched housing", 3),
        ("connector misaligned", 2),
        ("label smudged", 1),
    ];
    let smt_defects = [("tombstoned resistor", 3_i64), ("insufficient paste", 2)];

    let first_day = NaiveDate::from_ymd_opt(2026, 10, 5).context("invalid seed date")?;
    let mut inserted = 0usize;

    for day in 0..12_i64 {
        let record_date = first_day + Duration::days(day);
        if matches!(record_date.weekday(), Weekday::Sat | Weekday::Sun) {
            continue;
        }
        for (model, base_input) in models {
            for production_type_id in [FINAL_ASSEMBLY_TYPE_ID, SMT_TYPE_ID] {
                let input = base_input + day * 15 - i64::from(production_type_id) * 40;
                let entry = ProductionEntry {
                    record_date,
                    model,
                    production_type_id,
                    input,
                    output: input - (day % 4) - 2,
                    source_key: format!("seed-pd-{}-{model}-{production_type_id}", date_key(record_date)),
                };
                if insert_production(pool, &entry).await? {
                    inserted += 1;
                }
            }

            let defect_sets = [
                (FINAL_ASSEMBLY_TYPE_ID, &assembly_defects[..]),
                (SMT_TYPE_ID, &smt_defects[..]),
            ];
            for (production_type_id, defects) in defect_sets {
                for (rank, (defect, weight)) in defects.iter().enumerate() {
                    let quantity = (weight + day + rank as i64) % (weight + 3);
                    if quantity == 0 {
                        continue;
                    }
                    let entry = DefectEntry {
                        record_date,
                        model,
                        production_type_id,
                        defect,
                        quantity,
                        source_key: format!("seed-df-{}-{model}-{defect}", date_key(record_date)),
                    };
                    if insert_defect(pool, &entry).await? {
                        inserted += 1;
                    }
                }
            }
        }
    }

    info!(inserted, "seed rows written");
    Ok(())
}

pub async fn import_production_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        record_date: NaiveDate,
        model: String,
        production_type_id: i32,
        input: i64,
        output: i64,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let entry = ProductionEntry {
            record_date: row.record_date,
            model: &row.model,
            production_type_id: row.production_type_id,
            input: row.input,
            output: row.output,
            source_key: row
                .source_key
                .unwrap_or_else(|| format!("import-{}", Uuid::new_v4())),
        };
        if insert_production(pool, &entry).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}

pub async fn import_defects_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        record_date: NaiveDate,
        model: String,
        production_type_id: i32,
        defect: String,
        quantity: i64,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let entry = DefectEntry {
            record_date: row.record_date,
            model: &row.model,
            production_type_id: row.production_type_id,
            defect: &row.defect,
            quantity: row.quantity,
            source_key: row
                .source_key
                .unwrap_or_else(|| format!("import-{}", Uuid::new_v4())),
        };
        if insert_defect(pool, &entry).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}

/// Range spanning the `count` most recent weeks that have production records.
pub async fn latest_weeks(pool: &PgPool, count: i64) -> anyhow::Result<Option<WeekRange>> {
    let weeks: Vec<i32> = sqlx::query(
        r#"
        SELECT DISTINCT dt.week_num
        FROM production_dashboard.daily_production p
        JOIN production_dashboard.dates dt ON dt.id = p.date_id
        ORDER BY dt.week_num DESC
        LIMIT $1
        "#,
    )
    .bind(count)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| row.get("week_num"))
    .collect();

    Ok(match (weeks.iter().min(), weeks.iter().max()) {
        (Some(&start), Some(&end)) => Some(WeekRange { start, end }),
        _ => None,
    })
}

/// SQL predicate restricting `column` (a date key) to the window. Uses `$1`
/// and, for week ranges, `$2`; pair with [`bind_window`].
fn window_filter(column: &str, window: &QueryWindow) -> String {
    match window {
        QueryWindow::LastDays(_) => format!(
            "{column} IN (SELECT DISTINCT date_id FROM production_dashboard.daily_production \
             ORDER BY date_id DESC LIMIT $1)"
        ),
        QueryWindow::Weeks(_) => format!(
            "{column} IN (SELECT id FROM production_dashboard.dates WHERE week_num BETWEEN $1 AND $2)"
        ),
    }
}

fn bind_window<'q>(
    query: Query<'q, Postgres, PgArguments>,
    window: &QueryWindow,
) -> Query<'q, Postgres, PgArguments> {
    match *window {
        QueryWindow::LastDays(days) => query.bind(i64::from(days)),
        QueryWindow::Weeks(range) => query.bind(range.start).bind(range.end),
    }
}

/// Defect totals per defect and production type; every type is returned and
/// rows sharing a name are merged per scope during aggregation.
pub async fn fetch_defect_rows(pool: &PgPool, window: &QueryWindow) -> anyhow::Result<Vec<DefectRow>> {
    let sql = format!(
        "SELECT d.id AS defect_id, d.defect_name, d.pd_type_id, SUM(dd.qty)::BIGINT AS quantity \
         FROM production_dashboard.daily_defects dd \
         JOIN production_dashboard.defects d ON d.id = dd.defect_id \
         WHERE {} \
         GROUP BY d.id, d.defect_name, d.pd_type_id \
         ORDER BY d.defect_name, d.pd_type_id",
        window_filter("dd.date_id", window)
    );

    let records = bind_window(sqlx::query(&sql), window)
        .fetch_all(pool)
        .await
        .context("failed to fetch defect rows")?;

    let rows: Vec<DefectRow> = records
        .iter()
        .map(|row| DefectRow {
            criterion: row.get("defect_name"),
            quantity: row.get("quantity"),
            production_type_id: row.get("pd_type_id"),
            defect_id: Some(row.get("defect_id")),
        })
        .collect();

    info!(rows = rows.len(), %window, "fetched defect rows");
    Ok(rows)
}

/// One record per date, model and production type, newest first.
pub async fn fetch_daily_records(pool: &PgPool, window: &QueryWindow) -> anyhow::Result<Vec<DailyRecord>> {
    let sql = format!(
        "SELECT p.date_id, dt.week_num, m.full_name AS model_name, p.pd_type_id, \
                SUM(p.pd_input)::BIGINT AS pd_input, SUM(p.pd_output)::BIGINT AS pd_output, \
                d.defect_qty \
         FROM production_dashboard.daily_production p \
         JOIN production_dashboard.dates dt ON dt.id = p.date_id \
         JOIN production_dashboard.models m ON m.id = p.model_id \
         LEFT JOIN ( \
             SELECT dd.date_id, dd.model_id, df.pd_type_id, SUM(dd.qty)::BIGINT AS defect_qty \
             FROM production_dashboard.daily_defects dd \
             JOIN production_dashboard.defects df ON df.id = dd.defect_id \
             GROUP BY dd.date_id, dd.model_id, df.pd_type_id \
         ) d ON d.date_id = p.date_id AND d.model_id = p.model_id AND d.pd_type_id = p.pd_type_id \
         WHERE {} \
         GROUP BY p.date_id, dt.week_num, m.full_name, p.pd_type_id, d.defect_qty \
         ORDER BY p.date_id DESC, m.full_name",
        window_filter("p.date_id", window)
    );

    let records = bind_window(sqlx::query(&sql), window)
        .fetch_all(pool)
        .await
        .context("failed to fetch daily production records")?;

    let daily: Vec<DailyRecord> = records
        .iter()
        .map(|row| DailyRecord {
            date_id: row.get("date_id"),
            week_number: row.get("week_num"),
            model_name: row.get("model_name"),
            production_input: row.get("pd_input"),
            production_output: row.get("pd_output"),
            defect_quantity: row.get("defect_qty"),
            production_type_id: row.get("pd_type_id"),
        })
        .collect();

    info!(rows = daily.len(), %window, "fetched daily records");
    Ok(daily)
}

/// Rates for `defect_ids` over the `days` production dates before
/// `before_date_id`, measured against the scope's input on those dates.
/// Results follow the order of `defect_ids`.
pub async fn fetch_historical_rates(
    pool: &PgPool,
    scope: ProductionScope,
    defect_ids: &[i32],
    before_date_id: i32,
    days: u32,
) -> anyhow::Result<Vec<HistoricalRate>> {
    if defect_ids.is_empty() {
        return Ok(Vec::new());
    }

    const HISTORY_DATES: &str = "SELECT DISTINCT date_id FROM production_dashboard.daily_production \
                                 WHERE date_id < $1 ORDER BY date_id DESC LIMIT $2";

    let input_rows = sqlx::query(&format!(
        "SELECT pd_type_id, SUM(pd_input)::BIGINT AS pd_input \
         FROM production_dashboard.daily_production \
         WHERE date_id IN ({HISTORY_DATES}) \
         GROUP BY pd_type_id"
    ))
    .bind(before_date_id)
    .bind(i64::from(days))
    .fetch_all(pool)
    .await
    .context("failed to fetch historical production input")?;

    let production_input: i64 = input_rows
        .iter()
        .filter(|row| scope.matches(row.get("pd_type_id")))
        .map(|row| row.get::<i64, _>("pd_input"))
        .sum();

    let defect_rows = sqlx::query(&format!(
        "SELECT d.id, d.defect_name, COALESCE(SUM(dd.qty), 0)::BIGINT AS quantity \
         FROM production_dashboard.defects d \
         LEFT JOIN production_dashboard.daily_defects dd \
             ON dd.defect_id = d.id AND dd.date_id IN ({HISTORY_DATES}) \
         WHERE d.id = ANY($3) \
         GROUP BY d.id, d.defect_name"
    ))
    .bind(before_date_id)
    .bind(i64::from(days))
    .bind(defect_ids)
    .fetch_all(pool)
    .await
    .context("failed to fetch historical defect rates")?;

    let mut rates: Vec<HistoricalRate> = defect_rows
        .iter()
        .map(|row| {
            let quantity: i64 = row.get("quantity");
            HistoricalRate {
                defect_id: row.get("id"),
                criterion: row.get("defect_name"),
                quantity,
                production_input,
                dppm: aggregate::dppm(quantity, production_input),
            }
        })
        .collect();
    rates.sort_by_key(|rate| {
        defect_ids
            .iter()
            .position(|id| *id == rate.defect_id)
            .unwrap_or(usize::MAX)
    });

    info!(
        defects = rates.len(),
        before_date_id,
        production_input,
        "fetched historical rates"
    );
    Ok(rates)
}
