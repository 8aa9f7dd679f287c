//! Encrypted payment-details persistence.
//!
//! Cardholder name, billing address and payment token pass through the
//! opaque encryption collaborator before they touch the store; the core
//! only ever handles the ciphertext, which must round-trip verbatim.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::encryption::EncryptionService;
use crate::entities::payment_detail::{self, Entity as PaymentDetailEntity};
use crate::errors::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StorePaymentDetailsRequest {
    pub order_id: Uuid,
    #[validate(length(min = 1, message = "Payment method is required"))]
    pub method: String,
    pub transaction_reference: Option<String>,
    #[validate(length(min = 1, message = "Cardholder name is required"))]
    pub cardholder_name: String,
    #[validate(length(min = 1, message = "Billing address is required"))]
    pub billing_address: String,
    #[validate(length(min = 1, message = "Payment token is required"))]
    pub payment_token: String,
}

/// Decrypted view returned to authorized callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub id: Uuid,
    pub order_id: Uuid,
    pub method: String,
    pub transaction_reference: Option<String>,
    pub cardholder_name: String,
    pub billing_address: String,
    pub payment_token: String,
}

#[derive(Clone)]
pub struct PaymentDetailsService {
    db: Arc<DbPool>,
    cipher: Arc<dyn EncryptionService>,
}

impl PaymentDetailsService {
    pub fn new(db: Arc<DbPool>, cipher: Arc<dyn EncryptionService>) -> Self {
        Self { db, cipher }
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn store_payment_details(
        &self,
        request: StorePaymentDetailsRequest,
    ) -> Result<Uuid, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        let id = Uuid::new_v4();
        payment_detail::ActiveModel {
            id: Set(id),
            order_id: Set(request.order_id),
            method: Set(request.method),
            transaction_reference: Set(request.transaction_reference),
            cardholder_name_enc: Set(self.cipher.encrypt(&request.cardholder_name)?),
            billing_address_enc: Set(self.cipher.encrypt(&request.billing_address)?),
            payment_token_enc: Set(self.cipher.encrypt(&request.payment_token)?),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .map_err(ServiceError::db_error)?;

        info!(order_id = %request.order_id, "Payment details stored");
        Ok(id)
    }

    /// Latest payment details for an order, decrypted.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_payment_details(
        &self,
        order_id: Uuid,
    ) -> Result<PaymentDetails, ServiceError> {
        let model = PaymentDetailEntity::find()
            .filter(payment_detail::Column::OrderId.eq(order_id))
            .order_by_desc(payment_detail::Column::CreatedAt)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("payment details for order {}", order_id))
            })?;

        Ok(PaymentDetails {
            id: model.id,
            order_id: model.order_id,
            method: model.method,
            transaction_reference: model.transaction_reference,
            cardholder_name: self.cipher.decrypt(&model.cardholder_name_enc)?,
            billing_address: self.cipher.decrypt(&model.billing_address_enc)?,
            payment_token: self.cipher.decrypt(&model.payment_token_enc)?,
        })
    }
}
