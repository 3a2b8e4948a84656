//! Rendered-manifest parsing and change classification for ktl.
//!
//! A Helm-style release renders to a multi-document YAML stream. To show an
//! operator what an upgrade will do, ktl parses the previously deployed
//! stream and the proposed stream into normalized objects, then classifies
//! every object as `add`, `change`, `replace`, or `destroy`:
//!
//! - **add** — the proposed stream introduces an object the previous one
//!   did not have.
//! - **change** — both streams have the object and the server can mutate
//!   it in place.
//! - **replace** — both streams have the object but an immutable field
//!   changed (or the apiVersion migrated), so the server must
//!   delete-then-create.
//! - **destroy** — the previous stream had an object the proposed one
//!   drops.
//!
//! Helm hook objects (anything annotated `helm.sh/hook`) are tallied in a
//! separate bucket so auxiliary jobs never pollute workload totals.
//!
//! Normalization strips server-managed and cosmetic fields before
//! comparison so that a no-op upgrade diffs as empty. See [`normalize`] for
//! the exact rules.
//!
//! # Example
//!
//! ```
//! use ktl_manifest::{summarize, NormalizeOptions};
//!
//! let previous = "";
//! let proposed = r#"
//! apiVersion: v1
//! kind: ConfigMap
//! metadata:
//!   name: app-config
//!   namespace: demo
//! data:
//!   key: value
//! "#;
//!
//! let summary = summarize(previous, proposed, &NormalizeOptions::default()).unwrap();
//! assert_eq!(summary.add, 1);
//! assert_eq!(summary.change + summary.replace + summary.destroy, 0);
//! ```

mod immutable;
mod normalize;
mod object;
mod summary;

pub use immutable::immutable_change;
pub use normalize::{NormalizeOptions, normalize};
pub use object::{ManifestObject, api_group, api_group_version, parse_manifest};
pub use summary::{
    ChangeAction, HookChanges, PlanChange, PlanSummary, ServerDryRun, is_risky_kind, risky_counts,
    summarize, summarize_objects, summarize_with_probe,
};
