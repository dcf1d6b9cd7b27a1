//! Fixtures shared by the in-module tests.

use crate::models::{Credential, Cursor, Review, ReviewStatus};
use chrono::Utc;

pub fn premium_credential(id: &str, seller_id: &str) -> Credential {
    Credential {
        id: id.into(),
        seller_id: seller_id.into(),
        ozon_api_key: Some("api-key".into()),
        gpt_api_key: Some("gpt-key".into()),
        gpt_folder: Some("folder".into()),
        session_cookies: None,
        reply_cookies: None,
        is_premium: true,
        cursor: Cursor::default(),
        lease: None,
        disabled: false,
    }
}

pub fn standard_credential(id: &str, seller_id: &str) -> Credential {
    Credential {
        ozon_api_key: None,
        session_cookies: Some("session=abc".into()),
        reply_cookies: Some("session=reply".into()),
        is_premium: false,
        ..premium_credential(id, seller_id)
    }
}

pub fn review(id: &str, seller_id: &str, rating: i32, text: &str, status: ReviewStatus) -> Review {
    Review {
        id: id.into(),
        seller_id: seller_id.into(),
        sku: 123,
        text: text.into(),
        rating,
        status,
        published_at: Utc::now(),
        order_status: None,
        is_rating_participant: None,
    }
}
