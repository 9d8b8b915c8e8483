//! Customer contact lookups
//!
//! Subscription events only carry Stripe ids. The reconciler first tries the
//! local profile behind the subscription and falls back to asking Stripe for
//! the customer's email.

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{Customer, CustomerId};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Who to notify about a billing change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub email: String,
    pub name: Option<String>,
}

impl Contact {
    pub fn new(email: impl Into<String>, name: Option<String>) -> Self {
        Self {
            email: email.into(),
            name,
        }
    }

    /// Name to greet the customer with
    pub fn greeting_name(&self) -> &str {
        self.name
            .as_deref()
            .and_then(|n| n.split_whitespace().next())
            .unwrap_or("there")
    }
}

#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn customer_contact(&self, customer_id: &str) -> BillingResult<Option<Contact>>;
}

/// Looks customers up through the Stripe API
#[derive(Clone)]
pub struct StripeCustomerDirectory {
    stripe: StripeClient,
}

impl StripeCustomerDirectory {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

#[async_trait]
impl CustomerDirectory for StripeCustomerDirectory {
    async fn customer_contact(&self, customer_id: &str) -> BillingResult<Option<Contact>> {
        let id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID: {}", e)))?;

        let customer = Customer::retrieve(self.stripe.inner(), &id, &[]).await?;

        if customer.deleted {
            tracing::info!(customer_id = %customer_id, "Stripe customer has been deleted");
            return Ok(None);
        }

        Ok(customer
            .email
            .filter(|email| !email.is_empty())
            .map(|email| Contact::new(email, customer.name)))
    }
}

/// Fixed lookup table, for local runs without Stripe credentials and for tests
#[derive(Debug, Clone, Default)]
pub struct StaticCustomerDirectory {
    contacts: HashMap<String, Contact>,
}

impl StaticCustomerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contact(mut self, customer_id: impl Into<String>, contact: Contact) -> Self {
        self.contacts.insert(customer_id.into(), contact);
        self
    }
}

#[async_trait]
impl CustomerDirectory for StaticCustomerDirectory {
    async fn customer_contact(&self, customer_id: &str) -> BillingResult<Option<Contact>> {
        Ok(self.contacts.get(customer_id).cloned())
    }
}
