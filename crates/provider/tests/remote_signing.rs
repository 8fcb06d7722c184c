//! Cross-crate scenario: an attestation bound to an HSM-resident device key,
//! disclosed with the device signature routed through the instruction
//! protocol, and verified against a real certificate hierarchy.

use attesta_mdoc::cbor::Tag24;
use attesta_mdoc::engagement::{Handover, SessionTranscript};
use attesta_mdoc::holder::{Disclosed, Discloser};
use attesta_mdoc::issuer::{issue, validity_for};
use attesta_mdoc::keys::SoftwareEcdsaKey;
use attesta_mdoc::mdoc::Mdoc;
use attesta_mdoc::request::DeviceRequest;
use attesta_mdoc::verifier::verify;
use attesta_mdoc::x509::{Certificate, CertificateUsage, TrustAnchors};
use attesta_provider::instruction::DerVerifyingKey;
use attesta_provider::pin::PinKey;
use attesta_provider::{
    InMemoryAccounts, InstructionClient, InstructionService, SessionBroker, SoftHsm,
};
use chrono::Utc;
use ciborium::Value;
use indexmap::indexmap;
use p256::ecdsa::SigningKey;

const WALLET_ID: &str = "wallet-1";
const PIN: &str = "902851";
const PIN_SALT: [u8; 32] = [7; 32];
const DOC_TYPE: &str = "org.iso.18013.5.1.mDL";
const NS: &str = "org.iso.18013.5.1";

#[tokio::test]
async fn disclosure_signs_through_the_instruction_service() {
    let service =
        InstructionService::new(InMemoryAccounts::new(), SessionBroker::new(SoftHsm::new(), 4));
    let hw_key = SoftwareEcdsaKey::random();
    let pin_public_key = PinKey::new(PIN, &PIN_SALT).verifying_key().expect("pin key");
    service
        .register(WALLET_ID, &DerVerifyingKey(pin_public_key), &DerVerifyingKey(hw_key.public_key()))
        .await
        .expect("registration");

    // The device key lives in the HSM; the wallet only holds a handle.
    let client = InstructionClient::new(WALLET_ID, PIN, PIN_SALT.to_vec(), &hw_key, &service);
    let device_keys =
        client.generate_keys(vec!["device-key-1".to_string()]).await.expect("key generation");
    let device_key = &device_keys[0];

    // Issue under a real CA, bound to the HSM key's public half.
    let (ca, ca_key) = Certificate::new_ca("issuance ca").expect("ca");
    let (issuer_cert, issuer_key) =
        Certificate::new(&ca, &ca_key, "issuer", CertificateUsage::IssuerAuth).expect("leaf");
    let anchors = TrustAnchors::try_from_certificates(vec![ca]).expect("anchors");

    let issuer_signer = SoftwareEcdsaKey::from(issuer_key);
    let issuer_signed = issue(
        DOC_TYPE,
        indexmap! {
            NS.to_string() => vec![
                ("family_name".to_string(), Value::Text("Jansen".into())),
                ("given_name".to_string(), Value::Text("Willeke".into())),
            ],
        },
        &device_key.public_key(),
        validity_for(Utc::now(), 365),
        &[issuer_cert],
        &issuer_signer,
    )
    .await
    .expect("issuance");

    let mdoc = Mdoc {
        doc_type: DOC_TYPE.to_string(),
        issuer_signed,
        device_key_id: device_key.identifier().to_string(),
    };

    // Disclose one attribute; the device signature is produced by the HSM
    // behind the PIN-authenticated instruction protocol.
    let mut discloser = Discloser::new(mdoc);
    let engagement = discloser.engage().expect("engage");
    let reader_key = SigningKey::random(&mut rand::rngs::OsRng);
    let e_reader_key = Tag24((reader_key.verifying_key()).try_into().expect("cose key"));

    let request = DeviceRequest::new(
        DOC_TYPE.to_string(),
        indexmap! {
            NS.to_string() => indexmap! { "family_name".to_string() => true },
        },
    );
    let disclosed = discloser
        .respond(&request, e_reader_key.clone(), Handover::Qr, None, Utc::now(), device_key)
        .await
        .expect("respond");
    let Disclosed::Response(response) = disclosed else {
        panic!("request should have been answered");
    };

    let transcript = SessionTranscript(engagement, e_reader_key, Handover::Qr);
    let attributes = verify(&response, &anchors, &transcript, Utc::now()).expect("verification");
    assert_eq!(attributes[DOC_TYPE][NS].len(), 1);
    assert_eq!(attributes[DOC_TYPE][NS][0].name, "family_name");
}
