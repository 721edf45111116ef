use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::domain::Document;

/// Annulment type sent when the caller does not say otherwise: the
/// operation was rescinded.
pub const DEFAULT_ANNULMENT_TYPE: u8 = 2;

/// Build the annulment document for a processed DTE.
///
/// The annulment carries its own generation code and references the
/// original by generation code, control number and receipt stamp. Issuer
/// and receiver data are copied from the original content when present.
pub fn build_annulment(
    original: &Document,
    annulment_generation_code: &str,
    reason: &str,
    version: u32,
    now: DateTime<Utc>,
) -> Value {
    let content = &original.original_content;
    let receiver = content.get("receptor");
    let issued_on = content
        .pointer("/identificacion/fecEmi")
        .cloned()
        .unwrap_or_else(|| json!(original.created_at.format("%Y-%m-%d").to_string()));

    json!({
        "identificacion": {
            "version": version,
            "ambiente": original.environment.code(),
            "codigoGeneracion": annulment_generation_code,
            "fecAnula": now.format("%Y-%m-%d").to_string(),
            "horAnula": now.format("%H:%M:%S").to_string(),
        },
        "emisor": content.get("emisor").cloned().unwrap_or(Value::Null),
        "documento": {
            "tipoDte": original.document_type.code(),
            "codigoGeneracion": original.generation_code,
            "selloRecibido": original.receipt_stamp,
            "numeroControl": original.control_number,
            "fecEmi": issued_on,
            "montoIva": content.pointer("/resumen/totalIva").cloned().unwrap_or(Value::Null),
            "codigoGeneracionR": Value::Null,
            "tipoDocumento": receiver.and_then(|r| r.get("tipoDocumento")).cloned().unwrap_or(Value::Null),
            "numDocumento": receiver.and_then(|r| r.get("numDocumento")).cloned().unwrap_or(Value::Null),
            "nombre": receiver.and_then(|r| r.get("nombre")).cloned().unwrap_or(Value::Null),
        },
        "motivo": {
            "tipoAnulacion": DEFAULT_ANNULMENT_TYPE,
            "motivoAnulacion": reason,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DocumentStatus, DocumentType, Environment};
    use uuid::Uuid;

    fn processed() -> Document {
        let now = Utc::now();
        Document {
            id: Uuid::new_v4(),
            generation_code: "G1".to_string(),
            control_number: "DTE-01-M001P001-000000000000001".to_string(),
            document_type: DocumentType::Invoice,
            environment: Environment::Production,
            status: DocumentStatus::Processed,
            original_content: json!({
                "identificacion": {"fecEmi": "2026-10-01"},
                "emisor": {"nit": "06140101001010", "nombre": "ACME"},
                "receptor": {"tipoDocumento": "13", "numDocumento": "01234567-8", "nombre": "Cliente"},
                "resumen": {"totalIva": 1.3}
            }),
            signed_envelope: Some("jws".to_string()),
            receipt_stamp: Some("S1".to_string()),
            observations: None,
            attempt_count: 0,
            processed_at: Some(now),
            needs_reconciliation: false,
            last_failure: None,
            annulment_generation_code: None,
            annulment_receipt_stamp: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn references_the_original_document() {
        let doc = processed();
        let annulment = build_annulment(&doc, "A1", "duplicated sale", 2, Utc::now());

        assert_eq!(annulment["identificacion"]["codigoGeneracion"], "A1");
        assert_eq!(annulment["identificacion"]["ambiente"], "01");
        assert_eq!(annulment["documento"]["codigoGeneracion"], "G1");
        assert_eq!(annulment["documento"]["selloRecibido"], "S1");
        assert_eq!(annulment["documento"]["numeroControl"], "DTE-01-M001P001-000000000000001");
        assert_eq!(annulment["documento"]["fecEmi"], "2026-10-01");
        assert_eq!(annulment["documento"]["numDocumento"], "01234567-8");
        assert_eq!(annulment["emisor"]["nombre"], "ACME");
        assert_eq!(annulment["motivo"]["motivoAnulacion"], "duplicated sale");
    }

    #[test]
    fn missing_sections_become_null() {
        let mut doc = processed();
        doc.original_content = json!({});
        let annulment = build_annulment(&doc, "A1", "r", 2, Utc::now());
        assert!(annulment["emisor"].is_null());
        assert!(annulment["documento"]["nombre"].is_null());
        assert!(annulment["documento"]["fecEmi"].is_string());
    }
}
