use super::StoreResult;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};

/// Read-only lookup by the identity triple; used where creating the user as a
/// side effect would be wrong (e.g. duplicate checks before an import).
pub async fn find_user(
    pool: &PgPool,
    firstname: &str,
    lastname: Option<&str>,
    birthdate: Option<&str>,
) -> StoreResult<Option<i32>> {
    let user_id = sqlx::query_scalar(
        r#"
        SELECT user_id FROM users
        WHERE firstname = $1 AND lastname = $2 AND birthdate = $3
        "#,
    )
    .bind(firstname)
    .bind(lastname.unwrap_or(""))
    .bind(birthdate.unwrap_or(""))
    .fetch_optional(pool)
    .await?;
    Ok(user_id)
}

/// Resolves a user by the `(firstname, lastname, birthdate)` triple, creating
/// the row on first reference. Absent lastname/birthdate coerce to empty
/// strings so they participate in uniqueness. When height or weight arrive on
/// a later frame only the provided fields are patched.
///
/// Races on first insert resolve through the unique constraint: the loser
/// refetches and returns the winner's id.
pub async fn get_or_create_user(
    conn: &mut PgConnection,
    firstname: &str,
    lastname: Option<&str>,
    birthdate: Option<&str>,
    height: Option<f64>,
    weight: Option<f64>,
) -> StoreResult<i32> {
    let lastname = lastname.unwrap_or("");
    let birthdate = birthdate.unwrap_or("");
    let height = decimal_2(height);
    let weight = decimal_2(weight);

    let existing: Option<i32> = sqlx::query_scalar(
        r#"
        SELECT user_id FROM users
        WHERE firstname = $1 AND lastname = $2 AND birthdate = $3
        "#,
    )
    .bind(firstname)
    .bind(lastname)
    .bind(birthdate)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(user_id) = existing {
        if height.is_some() || weight.is_some() {
            sqlx::query(
                r#"
                UPDATE users
                SET height = COALESCE($2, height),
                    weight = COALESCE($3, weight),
                    updated_at = NOW()
                WHERE user_id = $1
                "#,
            )
            .bind(user_id)
            .bind(height)
            .bind(weight)
            .execute(&mut *conn)
            .await?;
        }
        return Ok(user_id);
    }

    let inserted: Option<i32> = sqlx::query_scalar(
        r#"
        INSERT INTO users (firstname, lastname, birthdate, height, weight)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (firstname, lastname, birthdate) DO NOTHING
        RETURNING user_id
        "#,
    )
    .bind(firstname)
    .bind(lastname)
    .bind(birthdate)
    .bind(height)
    .bind(weight)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(user_id) = inserted {
        return Ok(user_id);
    }

    // Lost the insert race; the row exists now.
    let user_id: i32 = sqlx::query_scalar(
        r#"
        SELECT user_id FROM users
        WHERE firstname = $1 AND lastname = $2 AND birthdate = $3
        "#,
    )
    .bind(firstname)
    .bind(lastname)
    .bind(birthdate)
    .fetch_one(&mut *conn)
    .await?;
    Ok(user_id)
}

/// Upserts a heart-rate device by name. Blank, whitespace-only and literal
/// "none" names mean no device is attached.
pub async fn get_or_create_heart_rate_device(
    conn: &mut PgConnection,
    name: Option<&str>,
) -> StoreResult<Option<i32>> {
    let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
        return Ok(None);
    };
    if name.eq_ignore_ascii_case("none") {
        return Ok(None);
    }

    let device_id: i32 = sqlx::query_scalar(
        r#"
        INSERT INTO heart_rate_devices (device_name)
        VALUES ($1)
        ON CONFLICT (device_name) DO UPDATE SET device_name = EXCLUDED.device_name
        RETURNING device_id
        "#,
    )
    .bind(name)
    .fetch_one(&mut *conn)
    .await?;
    Ok(Some(device_id))
}

fn decimal_2(value: Option<f64>) -> Option<Decimal> {
    value
        .filter(|v| v.is_finite())
        .and_then(Decimal::from_f64)
        .map(|d| d.round_dp(2))
}
