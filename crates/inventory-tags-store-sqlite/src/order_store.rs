use inventory_tags_core::{
    EntityKind, InventoryError, Order, OrderPatch, OrderStatus, PaymentMethod,
};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::info;

use crate::{conversion_error, now_text, optional_text, SqliteBackend};

/// Order rows. Creation exists for importers; edits go through the diff auditor.
pub struct OrderStore<'a> {
    backend: &'a SqliteBackend,
}

impl<'a> OrderStore<'a> {
    pub(crate) fn new(backend: &'a SqliteBackend) -> Self {
        Self { backend }
    }

    pub fn insert(&self, order: &Order) -> Result<(), InventoryError> {
        if order.client_name.trim().is_empty() {
            return Err(InventoryError::Validation(
                "order client_name MUST be provided".to_string(),
            ));
        }

        self.backend.run("orders.insert", |conn| {
            let now = now_text()?;
            conn.execute(
                "INSERT INTO orders(id, client_name, status, payment, reference_number, observation, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    order.id,
                    order.client_name.trim(),
                    order.status.as_str(),
                    order.payment.as_str(),
                    order.reference_number.as_deref().and_then(optional_text),
                    order.observation.as_deref().and_then(optional_text),
                    now,
                ],
            )?;
            Ok(())
        })?;

        info!(order_id = order.id, "inserted order");
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<Order>, InventoryError> {
        self.backend
            .run("orders.get", |conn| Ok(select_order(conn, id)?))
    }

    pub fn require(&self, id: i64) -> Result<Order, InventoryError> {
        self.get(id)?.ok_or(InventoryError::NotFound {
            kind: EntityKind::Order,
            id,
        })
    }
}

pub(crate) fn select_order(conn: &Connection, id: i64) -> rusqlite::Result<Option<Order>> {
    conn.query_row(
        "SELECT id, client_name, status, payment, reference_number, observation
         FROM orders WHERE id = ?1",
        params![id],
        parse_order_row,
    )
    .optional()
}

fn parse_order_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
    let status_raw: String = row.get(2)?;
    let payment_raw: String = row.get(3)?;

    let status = OrderStatus::from_label(&status_raw).ok_or_else(|| {
        conversion_error(2, Type::Text, format!("invalid order status: {status_raw}"))
    })?;
    let payment = PaymentMethod::from_label(&payment_raw).ok_or_else(|| {
        conversion_error(3, Type::Text, format!("invalid payment method: {payment_raw}"))
    })?;

    Ok(Order {
        id: row.get(0)?,
        client_name: row.get(1)?,
        status,
        payment,
        reference_number: row.get::<_, Option<String>>(4)?.as_deref().and_then(optional_text),
        observation: row.get::<_, Option<String>>(5)?.as_deref().and_then(optional_text),
    })
}

pub(crate) fn update_order_fields(
    conn: &Connection,
    patch: &OrderPatch,
    now: &str,
) -> rusqlite::Result<usize> {
    let mut assignments: Vec<(&'static str, SqlValue)> = Vec::new();
    if let Some(status) = patch.status {
        assignments.push(("status", SqlValue::Text(status.as_str().to_string())));
    }
    if let Some(payment) = patch.payment {
        assignments.push(("payment", SqlValue::Text(payment.as_str().to_string())));
    }
    if let Some(reference_number) = &patch.reference_number {
        assignments.push((
            "reference_number",
            optional_text(reference_number).map_or(SqlValue::Null, SqlValue::Text),
        ));
    }
    if let Some(observation) = &patch.observation {
        assignments.push((
            "observation",
            optional_text(observation).map_or(SqlValue::Null, SqlValue::Text),
        ));
    }
    if assignments.is_empty() {
        return Ok(0);
    }

    let set_clause = assignments
        .iter()
        .enumerate()
        .map(|(idx, (column, _))| format!("{column} = ?{}", idx + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE orders SET {set_clause}, updated_at = ?{} WHERE id = ?{}",
        assignments.len() + 1,
        assignments.len() + 2
    );

    let mut values: Vec<SqlValue> = assignments.into_iter().map(|(_, value)| value).collect();
    values.push(SqlValue::Text(now.to_string()));
    values.push(SqlValue::Integer(patch.id));
    conn.execute(&sql, params_from_iter(values))
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use inventory_tags_core::{InventoryError, Order, OrderStatus, PaymentMethod};

    #[test]
    fn insert_and_read_back_order() {
        let backend = fixture_backend();
        let order = Order {
            id: 1,
            client_name: "Peixaria Central".to_string(),
            status: OrderStatus::NotGenerated,
            payment: PaymentMethod::ToArrange,
            reference_number: None,
            observation: Some("  ".to_string()),
        };
        must(backend.orders().insert(&order));

        let stored = must(backend.orders().require(1));
        assert_eq!(stored.status, OrderStatus::NotGenerated);
        assert_eq!(stored.payment, PaymentMethod::ToArrange);
        assert_eq!(stored.observation, None);

        assert!(matches!(
            backend.orders().require(2),
            Err(InventoryError::NotFound { id: 2, .. })
        ));
    }

    #[test]
    fn legacy_order_labels_are_decoded() {
        let backend = fixture_backend();
        must(backend.connection().execute(
            "INSERT INTO orders(id, client_name, status, payment, updated_at)
             VALUES (4, 'Mercado', 'NÃO GERADO', 'CARTÃO', '2026-01-01T00:00:00Z')",
            [],
        ));
        let order = must(backend.orders().require(4));
        assert_eq!(order.status, OrderStatus::NotGenerated);
        assert_eq!(order.payment, PaymentMethod::Card);
    }
}
