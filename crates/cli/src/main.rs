//! Terminal harness for the enrolment workflow.
//!
//! Each invocation restores the stored draft, applies one command, and snapshots the draft
//! again. Codes are checked by the fixed development dispatcher (`ENROL_DEV_OTP`), since every
//! command runs in its own process.

use clap::{Parser, Subcommand, ValueEnum};
use enrol_core::config::{
    autosave_interval_from_env_value, consent_catalogue_from_env_value, data_dir_from_env_value,
    verification_policy_from_env_values,
};
use enrol_core::{
    BloodGroup, CaptureMethod, CoreConfig, DraftPersistence, EnrolError, EnrollmentSession,
    FieldErrors, FileDraftStorage, FixedCodeDispatcher, Gender, IdentityLinkMode, PhotoReference,
    RestoreStatus, YamlRecordSink,
};
use enrol_files::PhotoStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_DEV_CODE: &str = "123456";

#[derive(Parser)]
#[command(name = "enrol")]
#[command(about = "Patient enrolment workflow CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum GenderArg {
    Male,
    Female,
    Other,
    Undisclosed,
}

impl From<GenderArg> for Gender {
    fn from(arg: GenderArg) -> Self {
        match arg {
            GenderArg::Male => Gender::Male,
            GenderArg::Female => Gender::Female,
            GenderArg::Other => Gender::Other,
            GenderArg::Undisclosed => Gender::Undisclosed,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum IdentityModeArg {
    LinkExisting,
    CreateNew,
    Skip,
}

#[derive(Clone, Copy, ValueEnum)]
enum FlowArg {
    Identity,
    Consent,
}

#[derive(Clone, Copy, ValueEnum)]
enum MethodArg {
    Upload,
    Camera,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the active step and what blocks it
    Status,
    /// List consent catalogue items
    Catalogue,
    /// Edit demographics (only the given fields change)
    Demographics {
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        middle_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        /// Date of birth (YYYY-MM-DD)
        #[arg(long)]
        dob: Option<String>,
        #[arg(long, value_enum)]
        gender: Option<GenderArg>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        postal_code: Option<String>,
    },
    /// Choose how the health ID is handled
    IdentityLink {
        #[arg(value_enum)]
        mode: IdentityModeArg,
        /// Health ID number (link-existing) or requested address (create-new)
        value: Option<String>,
    },
    /// Request a verification code
    SendCode {
        #[arg(value_enum)]
        flow: FlowArg,
        /// Replace an outstanding code
        #[arg(long)]
        resend: bool,
    },
    /// Submit a verification code
    Verify {
        #[arg(value_enum)]
        flow: FlowArg,
        code: String,
    },
    /// Attach a photo from an image file, or remove it
    Photo {
        path: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "upload")]
        method: MethodArg,
        #[arg(long, conflicts_with = "path")]
        remove: bool,
    },
    /// Set emergency contacts
    EmergencyContact {
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        relationship: String,
        #[arg(long)]
        secondary_name: Option<String>,
        #[arg(long)]
        secondary_phone: Option<String>,
        #[arg(long)]
        secondary_relationship: Option<String>,
    },
    /// Set medical history
    MedicalHistory {
        /// Blood group, e.g. "O+"
        #[arg(long)]
        blood_group: Option<String>,
        #[arg(long = "allergy")]
        allergies: Vec<String>,
        #[arg(long = "condition")]
        conditions: Vec<String>,
        #[arg(long = "medication")]
        medications: Vec<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Grant (or withdraw) a consent item
    Consent {
        item: String,
        #[arg(long)]
        withdraw: bool,
    },
    /// Move to the next step
    Next,
    /// Move to the previous step
    Previous,
    /// Save the draft now
    Save,
    /// Discard the draft and start again
    Reset,
    /// Accept the completed enrolment and write the record
    Finish,
}

fn load_config() -> anyhow::Result<CoreConfig> {
    let data_dir = data_dir_from_env_value(std::env::var("ENROL_DATA_DIR").ok());
    let policy = verification_policy_from_env_values(
        std::env::var("ENROL_OTP_MAX_ATTEMPTS").ok(),
        std::env::var("ENROL_OTP_TTL_SECS").ok(),
    )?;
    let autosave = autosave_interval_from_env_value(std::env::var("ENROL_AUTOSAVE_SECS").ok())?;
    let catalogue =
        consent_catalogue_from_env_value(std::env::var("ENROL_CONSENT_CATALOGUE").ok())?;
    Ok(CoreConfig::new(data_dir, policy, autosave, catalogue)?)
}

fn print_errors(errors: &FieldErrors) {
    for (field, message) in errors.iter() {
        println!("  - {field}: {message}");
    }
}

fn print_status(session: &EnrollmentSession) {
    let view = session.view();
    println!(
        "Step {}/{}: {}",
        view.position, view.total_steps, view.title
    );
    println!(
        "Identity verification: {}, consent verification: {}",
        view.identity_verification, view.consent_verification
    );
    match view.saved_at {
        Some(saved_at) => println!("Last saved: {saved_at}"),
        None => println!("Not saved yet"),
    }
    if let Some(completion) = &view.completion {
        println!("Patient token: {}", completion.patient_token);
        println!("Scan payload: {}", completion.scan_payload);
    }
    if view.errors.is_empty() {
        println!("No field errors.");
    } else {
        println!("Field errors:");
        print_errors(&view.errors);
    }
    println!("Can advance: {}", if view.can_advance { "yes" } else { "no" });
}

/// Prints a user-facing failure; returns it for the exit path.
fn report(err: EnrolError) -> anyhow::Error {
    if let EnrolError::StepBlocked { step, errors } = &err {
        eprintln!("Cannot leave {step}:");
        print_errors(errors);
    }
    anyhow::Error::new(err)
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("enrol_core=warn".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let cfg = Arc::new(load_config()?);
    let dev_code = std::env::var("ENROL_DEV_OTP")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DEV_CODE.into());
    let storage = FileDraftStorage::new(&cfg.drafts_dir())?;
    let (mut session, status) = EnrollmentSession::start(
        cfg.clone(),
        Arc::new(FixedCodeDispatcher::new(dev_code)),
        DraftPersistence::new(Arc::new(storage)),
    );
    match status {
        RestoreStatus::Discarded { reason } => {
            eprintln!("Stored draft was unusable and has been discarded ({reason}).")
        }
        RestoreStatus::Resumed {
            clamped_from: Some(from),
            position,
        } => eprintln!("Draft was at {from} but resumes at {position}."),
        _ => {}
    }

    let mut save_after = true;

    match cli.command {
        Commands::Status => {
            save_after = false;
            print_status(&session);
        }
        Commands::Catalogue => {
            save_after = false;
            for item in cfg.consent_catalogue().items() {
                let marker = if item.required { "required" } else { "optional" };
                let granted = session.draft().consent.granted.contains(&item.id);
                println!(
                    "[{}] {} ({}) - {}",
                    if granted { "x" } else { " " },
                    item.id,
                    marker,
                    item.label
                );
            }
        }
        Commands::Demographics {
            first_name,
            middle_name,
            last_name,
            dob,
            gender,
            phone,
            email,
            city,
            postal_code,
        } => {
            let mut demographics = session.draft().demographics.clone();
            if let Some(v) = first_name {
                demographics.first_name = v;
            }
            if let Some(v) = middle_name {
                demographics.middle_name = v;
            }
            if let Some(v) = last_name {
                demographics.last_name = v;
            }
            if let Some(v) = dob {
                demographics.date_of_birth = v;
            }
            if let Some(v) = gender {
                demographics.gender = Some(v.into());
            }
            if let Some(v) = phone {
                demographics.phone = v;
            }
            if email.is_some() {
                demographics.email = email;
            }
            if let Some(v) = city {
                demographics.address.city = v;
            }
            if let Some(v) = postal_code {
                demographics.address.postal_code = v;
            }
            let errors = session.edit_demographics(demographics).map_err(report)?;
            print_errors(&errors);
        }
        Commands::IdentityLink { mode, value } => {
            let value = value.unwrap_or_default();
            let mode = match mode {
                IdentityModeArg::LinkExisting => IdentityLinkMode::LinkExisting { health_id: value },
                IdentityModeArg::CreateNew => IdentityLinkMode::CreateNew {
                    requested_address: value,
                },
                IdentityModeArg::Skip => IdentityLinkMode::Skip,
            };
            let errors = session.select_identity_link(mode).map_err(report)?;
            print_errors(&errors);
        }
        Commands::SendCode { flow, resend } => {
            match flow {
                FlowArg::Identity => session.send_identity_code(resend),
                FlowArg::Consent => session.send_consent_code(resend),
            }
            .map_err(report)?;
            println!("Code sent.");
        }
        Commands::Verify { flow, code } => {
            let result = match flow {
                FlowArg::Identity => session.submit_identity_code(&code),
                FlowArg::Consent => session.submit_consent_code(&code),
            };
            // Failed attempts still count, so the draft is saved either way.
            if let Err(e) = result {
                session.save_draft()?;
                return Err(report(e));
            }
            println!("Verified.");
        }
        Commands::Photo {
            path,
            method,
            remove,
        } => {
            if remove {
                session.remove_photo().map_err(report)?;
                println!("Photo removed.");
            } else {
                let path = path.ok_or_else(|| anyhow::anyhow!("a photo path is required"))?;
                let store = PhotoStore::new(&cfg.photos_dir())?;
                let stored = store.add(&path)?;
                let method = match method {
                    MethodArg::Upload => CaptureMethod::Upload,
                    MethodArg::Camera => CaptureMethod::Camera,
                };
                let reference = PhotoReference {
                    handle: stored.hash.clone(),
                    media_type: Some(stored.media_type),
                    size_bytes: stored.size_bytes,
                };
                session.attach_photo(reference, method).map_err(report)?;
                println!("Photo stored as {}", stored.hash);
            }
        }
        Commands::EmergencyContact {
            name,
            phone,
            relationship,
            secondary_name,
            secondary_phone,
            secondary_relationship,
        } => {
            let mut contacts = session.draft().emergency_contact.clone();
            contacts.primary.name = name;
            contacts.primary.phone = phone;
            contacts.primary.relationship = relationship;
            contacts.has_secondary = secondary_name.is_some()
                || secondary_phone.is_some()
                || secondary_relationship.is_some();
            if contacts.has_secondary {
                contacts.secondary.name = secondary_name.unwrap_or_default();
                contacts.secondary.phone = secondary_phone.unwrap_or_default();
                contacts.secondary.relationship = secondary_relationship.unwrap_or_default();
            }
            let errors = session.edit_emergency_contacts(contacts).map_err(report)?;
            print_errors(&errors);
        }
        Commands::MedicalHistory {
            blood_group,
            allergies,
            conditions,
            medications,
            notes,
        } => {
            let mut history = session.draft().medical_history.clone();
            if let Some(group) = blood_group {
                let parsed: BloodGroup = serde_json::from_value(serde_json::Value::String(group))
                    .map_err(|_| anyhow::anyhow!("unknown blood group"))?;
                history.blood_group = Some(parsed);
            }
            if !allergies.is_empty() {
                history.allergies = allergies;
            }
            if !conditions.is_empty() {
                history.chronic_conditions = conditions;
            }
            if !medications.is_empty() {
                history.current_medications = medications;
            }
            if let Some(notes) = notes {
                history.notes = notes;
            }
            session.edit_medical_history(history).map_err(report)?;
        }
        Commands::Consent { item, withdraw } => {
            let errors = session.set_consent(&item, !withdraw).map_err(report)?;
            print_errors(&errors);
        }
        Commands::Next => {
            let step = session.advance().map_err(report)?;
            println!("Now at {step}");
            if let Some(completion) = &session.draft().completion {
                println!("Patient token: {}", completion.patient_token);
            }
        }
        Commands::Previous => {
            let step = session.retreat().map_err(report)?;
            println!("Now at {step}");
        }
        Commands::Save => {
            save_after = false;
            let receipt = session.save_draft()?;
            println!("Draft saved at {}", receipt.saved_at);
        }
        Commands::Reset => {
            save_after = false;
            session.reset()?;
            println!("Enrolment reset.");
        }
        Commands::Finish => {
            save_after = false;
            let sink = YamlRecordSink::new(&cfg.records_dir());
            let result = session.finish(&sink).map_err(report)?;
            println!("Enrolment complete.");
            println!("Patient token: {}", result.patient_token);
            println!("Scan payload: {}", result.scan_payload);
            println!(
                "Record: {}",
                sink.record_path(&result.patient_token).display()
            );
        }
    }

    if save_after && session.is_dirty() {
        session.save_draft()?;
    }

    Ok(())
}
