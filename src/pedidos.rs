//! Order (pedido) submission.
//!
//! Orders have no cached table: a checkout either reaches the backend or
//! rides in the outbox as a single durable payload. Submission fans out as
//! header first, then one detail per cart line, then the modifiers of each
//! detail, matching the backend's nested resources.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::RemoteApi;
use crate::db::Db;
use crate::error::SyncError;
use crate::mapper::{normalize_money, pick_object, value_i64, value_str};
use crate::oracle::Connectivity;
use crate::outbox::{self, EntityType, NewEntry, OutboxEntry, OutboxOp};

const COLLECTION: &str = "v1/pedidos/";

/// One modifier applied to a cart line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartModificador {
    pub modificador_id: String,
    pub nombre: String,
    pub precio_extra: f64,
}

/// One cart line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub producto_id: String,
    pub nombre: String,
    pub cantidad: i64,
    pub precio_unitario: f64,
    #[serde(default)]
    pub nota: Option<String>,
    #[serde(default)]
    pub modificadores: Vec<CartModificador>,
}

/// A complete checkout, serializable as-is into an outbox payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutPedido {
    pub items: Vec<CartItem>,
    pub total: f64,
    /// Till-assigned order number, unique per branch and day.
    #[serde(default)]
    pub numero_pedido: Option<String>,
    #[serde(default)]
    pub descuento: Option<f64>,
    #[serde(default)]
    pub iva: Option<f64>,
    #[serde(default)]
    pub tipo_entrega: Option<String>,
    #[serde(default)]
    pub nota: Option<String>,
}

/// Result of a checkout attempt.
#[derive(Debug, Clone)]
pub enum PedidoOutcome {
    /// The backend accepted the order and assigned this id.
    Created { id: String },
    /// The order was queued for background delivery.
    Queued { entry_key: i64 },
}

pub struct PedidosRepo<A: RemoteApi> {
    db: Arc<Db>,
    api: Arc<A>,
    net: Arc<dyn Connectivity>,
}

impl<A: RemoteApi> PedidosRepo<A> {
    pub fn new(db: Arc<Db>, api: Arc<A>, net: Arc<dyn Connectivity>) -> Self {
        Self { db, api, net }
    }

    /// Submit a checkout. Offline or on a retryable failure the whole
    /// checkout is queued as one entry so it replays atomically from the
    /// till's point of view.
    pub async fn create_pedido(&self, checkout: &CheckoutPedido) -> Result<PedidoOutcome, SyncError> {
        if checkout.items.is_empty() {
            return Err(SyncError::Validation("El pedido no tiene items".into()));
        }

        if !self.net.is_online() {
            let entry = self.enqueue_checkout(checkout)?;
            return Ok(PedidoOutcome::Queued {
                entry_key: entry.key,
            });
        }

        match self.send_checkout(checkout, false, None).await {
            Ok(id) => Ok(PedidoOutcome::Created { id }),
            Err(e) if e.should_enqueue() => {
                info!("pedido deferred to outbox: {}", e.user_message());
                let entry = self.enqueue_checkout(checkout)?;
                Ok(PedidoOutcome::Queued {
                    entry_key: entry.key,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn enqueue_checkout(&self, checkout: &CheckoutPedido) -> Result<OutboxEntry, SyncError> {
        outbox::enqueue(
            &self.db,
            NewEntry {
                entity_type: EntityType::Pedido,
                op: OutboxOp::Create,
                payload: serde_json::to_value(checkout)?,
                temp_id: None,
                target_id: None,
            },
        )
    }

    /// Header, then details, then modifiers. `es_offline` marks orders that
    /// were taken without connectivity so reporting can tell them apart.
    async fn send_checkout(
        &self,
        checkout: &CheckoutPedido,
        es_offline: bool,
        idempotency_key: Option<&str>,
    ) -> Result<String, SyncError> {
        let mut header = json!({
            "total": normalize_money(&checkout.total.to_string()),
            "tipo_entrega": checkout.tipo_entrega,
            "nota": checkout.nota,
            "es_offline": es_offline,
        });
        if let Some(n) = &checkout.numero_pedido {
            header["numero_pedido"] = json!(n);
        }
        if let Some(d) = checkout.descuento {
            header["descuento"] = json!(normalize_money(&d.to_string()));
        }
        if let Some(i) = checkout.iva {
            header["iva"] = json!(normalize_money(&i.to_string()));
        }
        let res = self
            .api
            .request(Method::POST, COLLECTION, Some(&header), idempotency_key)
            .await?;
        let pedido = pick_object(&res);
        let pedido_id = value_str(&pedido, &["id", "pk", "pedido_id"])
            .or_else(|| value_i64(&pedido, &["id", "pk", "pedido_id"]).map(|n| n.to_string()))
            .ok_or_else(|| SyncError::transport("Respuesta del servidor sin pedido"))?;

        for item in &checkout.items {
            let detalle_body = json!({
                "producto_id": item.producto_id,
                "cantidad": item.cantidad,
                "precio_unitario": normalize_money(&item.precio_unitario.to_string()),
                "nota": item.nota,
            });
            let detalle_path = format!("{COLLECTION}{pedido_id}/detalles/");
            let detalle_res = self
                .api
                .request(Method::POST, &detalle_path, Some(&detalle_body), None)
                .await?;
            let detalle = pick_object(&detalle_res);
            let detalle_id = value_str(&detalle, &["id", "pk", "detalle_id"])
                .or_else(|| value_i64(&detalle, &["id", "pk"]).map(|n| n.to_string()));

            let Some(detalle_id) = detalle_id else {
                // A detail without an id cannot take modifiers; keep going
                // with the remaining lines.
                if !item.modificadores.is_empty() {
                    warn!(
                        producto_id = %item.producto_id,
                        "detalle sin id, modificadores omitidos"
                    );
                }
                continue;
            };

            for m in &item.modificadores {
                let mod_body = json!({
                    "modificador_id": m.modificador_id,
                    "nombre": m.nombre,
                    "precio_extra": normalize_money(&m.precio_extra.to_string()),
                });
                let mod_path = format!("{COLLECTION}detalles/{detalle_id}/modificadores/");
                self.api
                    .request(Method::POST, &mod_path, Some(&mod_body), None)
                    .await?;
            }
        }

        Ok(pedido_id)
    }

    /// Register a cash payment against an order. Queued when the backend
    /// cannot be reached; the till already took the money either way.
    pub async fn register_cash_payment(
        &self,
        pedido_id: &str,
        monto: f64,
    ) -> Result<PedidoOutcome, SyncError> {
        let body = cash_payment_body(monto);
        let path = format!("{COLLECTION}{pedido_id}/pagos/");
        match self.api.request(Method::POST, &path, Some(&body), None).await {
            Ok(_) => Ok(PedidoOutcome::Created {
                id: pedido_id.to_string(),
            }),
            Err(e) if e.should_enqueue() => {
                info!("cash payment deferred to outbox: {}", e.user_message());
                let entry = outbox::enqueue(
                    &self.db,
                    NewEntry {
                        entity_type: EntityType::Pedido,
                        op: OutboxOp::CashPayment,
                        payload: json!({ "monto": monto }),
                        temp_id: None,
                        target_id: Some(pedido_id.to_string()),
                    },
                )?;
                Ok(PedidoOutcome::Queued {
                    entry_key: entry.key,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Replay one queued pedido entry. Queued checkouts are marked
    /// `es_offline` and reuse the entry's idempotency key so a double drain
    /// cannot double-charge the order.
    pub async fn process_outbox_entry(&self, entry: &OutboxEntry) -> Result<(), SyncError> {
        match entry.op {
            OutboxOp::Create => {
                let checkout: CheckoutPedido = serde_json::from_value(entry.payload.clone())?;
                self.send_checkout(&checkout, true, Some(&entry.idempotency_key))
                    .await?;
                Ok(())
            }
            OutboxOp::CashPayment => {
                let pedido_id = entry.target_id.as_deref().ok_or_else(|| {
                    SyncError::UnsupportedEntry("cash-payment sin pedido".into())
                })?;
                let monto = entry
                    .payload
                    .get("monto")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                let path = format!("{COLLECTION}{pedido_id}/pagos/");
                self.api
                    .request(Method::POST, &path, Some(&cash_payment_body(monto)), None)
                    .await?;
                Ok(())
            }
            other => Err(SyncError::UnsupportedEntry(format!(
                "pedido {}",
                other.as_str()
            ))),
        }
    }
}

fn cash_payment_body(monto: f64) -> Value {
    json!({
        "metodo": "efectivo",
        "monto": normalize_money(&monto.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::FlagOracle;
    use crate::test_support::MockApi;

    fn checkout() -> CheckoutPedido {
        CheckoutPedido {
            items: vec![
                CartItem {
                    producto_id: "41".into(),
                    nombre: "Taco al pastor".into(),
                    cantidad: 2,
                    precio_unitario: 2900.0,
                    nota: None,
                    modificadores: vec![CartModificador {
                        modificador_id: "7".into(),
                        nombre: "Extra queso".into(),
                        precio_extra: 500.0,
                    }],
                },
                CartItem {
                    producto_id: "42".into(),
                    nombre: "Quesadilla".into(),
                    cantidad: 1,
                    precio_unitario: 3200.0,
                    nota: Some("sin cebolla".into()),
                    modificadores: vec![],
                },
            ],
            total: 9500.0,
            numero_pedido: Some("P-012".into()),
            descuento: None,
            iva: Some(1805.0),
            tipo_entrega: Some("local".into()),
            nota: None,
        }
    }

    /// Answer creates with ids keyed by path shape.
    fn checkout_api() -> MockApi {
        MockApi::new(|_, path, _| {
            if path == "v1/pedidos/" {
                Ok(json!({ "id": 900 }))
            } else if path.ends_with("/detalles/") {
                Ok(json!({ "id": 55 }))
            } else {
                Ok(json!({}))
            }
        })
    }

    fn repo(api: MockApi, online: bool) -> PedidosRepo<MockApi> {
        PedidosRepo::new(
            Arc::new(Db::open_in_memory().unwrap()),
            Arc::new(api),
            Arc::new(FlagOracle::new(online, true)),
        )
    }

    #[tokio::test]
    async fn test_create_pedido_fans_out_header_details_modifiers() {
        let repo = repo(checkout_api(), true);
        let outcome = repo.create_pedido(&checkout()).await.unwrap();
        let PedidoOutcome::Created { id } = outcome else {
            panic!("expected remote creation");
        };
        assert_eq!(id, "900");

        let calls = repo.api.calls();
        let paths: Vec<&str> = calls.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "v1/pedidos/",
                "v1/pedidos/900/detalles/",
                "v1/pedidos/detalles/55/modificadores/",
                "v1/pedidos/900/detalles/",
            ]
        );
        assert_eq!(calls[0].body.as_ref().unwrap()["es_offline"], json!(false));
        assert_eq!(calls[0].body.as_ref().unwrap()["total"], json!("9500.00"));
        assert_eq!(calls[0].body.as_ref().unwrap()["numero_pedido"], json!("P-012"));
        assert_eq!(calls[0].body.as_ref().unwrap()["iva"], json!("1805.00"));
        assert!(outbox::list_pending(&repo.db).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_pedido_offline_queues_whole_checkout() {
        let repo = repo(checkout_api(), false);
        let outcome = repo.create_pedido(&checkout()).await.unwrap();
        assert!(matches!(outcome, PedidoOutcome::Queued { .. }));
        assert_eq!(repo.api.call_count(), 0);

        let pending = outbox::list_pending(&repo.db).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_type, EntityType::Pedido);
        let stored: CheckoutPedido =
            serde_json::from_value(pending[0].payload.clone()).unwrap();
        assert_eq!(stored.items.len(), 2);
        assert_eq!(stored.total, 9500.0);
    }

    #[tokio::test]
    async fn test_create_pedido_retryable_failure_queues() {
        let repo = repo(MockApi::failing(503), true);
        let outcome = repo.create_pedido(&checkout()).await.unwrap();
        assert!(matches!(outcome, PedidoOutcome::Queued { .. }));
        assert_eq!(outbox::list_pending(&repo.db).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_pedido_terminal_failure_propagates() {
        let repo = repo(MockApi::failing(400), true);
        let err = repo.create_pedido(&checkout()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(outbox::list_pending(&repo.db).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_pedido_rejects_empty_cart() {
        let repo = repo(checkout_api(), true);
        let empty = CheckoutPedido {
            items: vec![],
            total: 0.0,
            numero_pedido: None,
            descuento: None,
            iva: None,
            tipo_entrega: None,
            nota: None,
        };
        let err = repo.create_pedido(&empty).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_replay_marks_offline_and_sends_idempotency_key() {
        let offline_repo = repo(checkout_api(), false);
        offline_repo.create_pedido(&checkout()).await.unwrap();
        let entry = outbox::list_pending(&offline_repo.db).unwrap().remove(0);

        let online: Arc<MockApi> = Arc::new(checkout_api());
        let repo2 = PedidosRepo::new(
            offline_repo.db.clone(),
            online.clone(),
            offline_repo.net.clone(),
        );
        repo2.process_outbox_entry(&entry).await.unwrap();

        let calls = online.calls();
        assert_eq!(calls[0].path, "v1/pedidos/");
        assert_eq!(calls[0].body.as_ref().unwrap()["es_offline"], json!(true));
        assert_eq!(
            calls[0].idempotency_key.as_deref(),
            Some(entry.idempotency_key.as_str())
        );
    }

    #[tokio::test]
    async fn test_cash_payment_failure_enqueues() {
        let repo = repo(MockApi::offline(), true);
        let outcome = repo.register_cash_payment("900", 9500.0).await.unwrap();
        assert!(matches!(outcome, PedidoOutcome::Queued { .. }));

        let pending = outbox::list_pending(&repo.db).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op, OutboxOp::CashPayment);
        assert_eq!(pending[0].target_id.as_deref(), Some("900"));
    }

    #[tokio::test]
    async fn test_replay_cash_payment_posts_efectivo_body() {
        let repo = repo(MockApi::ok(json!({})), true);
        let entry = outbox::enqueue(
            &repo.db,
            NewEntry {
                entity_type: EntityType::Pedido,
                op: OutboxOp::CashPayment,
                payload: json!({ "monto": 9500.0 }),
                temp_id: None,
                target_id: Some("900".into()),
            },
        )
        .unwrap();

        repo.process_outbox_entry(&entry).await.unwrap();

        let calls = repo.api.calls();
        assert_eq!(calls[0].path, "v1/pedidos/900/pagos/");
        let body = calls[0].body.as_ref().unwrap();
        assert_eq!(body["metodo"], json!("efectivo"));
        assert_eq!(body["monto"], json!("9500.00"));
    }
}
