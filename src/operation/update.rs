use bson::{doc, Bson, Document};
use serde::Deserialize;

use super::{remove_empty_write_concern, Operation, Retryability, WriteResponseBody};
use crate::{
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{convert_bulk_errors, Result},
    options::UpdateOptions,
    results::UpdateResult,
    Namespace,
};

/// The model of an update: either a modification document/pipeline or a full replacement.
#[derive(Clone, Debug)]
pub(crate) enum UpdateOrReplace {
    UpdateModifications(UpdateModifications),
    Replacement(Document),
}

/// A modification to apply to matched documents: an update document of `$`-operators or an
/// aggregation pipeline.
#[derive(Clone, Debug)]
pub(crate) enum UpdateModifications {
    Document(Document),
    Pipeline(Vec<Document>),
}

impl UpdateModifications {
    fn to_bson(&self) -> Bson {
        match self {
            UpdateModifications::Document(doc) => Bson::Document(doc.clone()),
            UpdateModifications::Pipeline(pipeline) => {
                Bson::Array(pipeline.iter().cloned().map(Bson::Document).collect())
            }
        }
    }
}

impl UpdateOrReplace {
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            UpdateOrReplace::UpdateModifications(UpdateModifications::Document(doc)) => {
                bson_util::update_document_check(doc)
            }
            UpdateOrReplace::UpdateModifications(UpdateModifications::Pipeline(_)) => Ok(()),
            UpdateOrReplace::Replacement(doc) => bson_util::replacement_document_check(doc),
        }
    }

    fn to_bson(&self) -> Bson {
        match self {
            UpdateOrReplace::UpdateModifications(modifications) => modifications.to_bson(),
            UpdateOrReplace::Replacement(doc) => Bson::Document(doc.clone()),
        }
    }
}

impl From<Document> for UpdateModifications {
    fn from(doc: Document) -> Self {
        UpdateModifications::Document(doc)
    }
}

/// An `update` command targeting a single filter/update pair.
#[derive(Debug)]
pub(crate) struct Update {
    ns: Namespace,
    filter: Document,
    update: UpdateOrReplace,
    multi: Option<bool>,
    options: Option<UpdateOptions>,
}

impl Update {
    pub(crate) fn new(
        ns: Namespace,
        filter: Document,
        update: UpdateOrReplace,
        multi: bool,
        mut options: Option<UpdateOptions>,
    ) -> Result<Self> {
        update.validate()?;
        remove_empty_write_concern!(options);
        Ok(Self {
            ns,
            filter,
            update,
            multi: multi.then(|| true),
            options,
        })
    }
}

impl Operation for Update {
    type O = UpdateResult;

    const NAME: &'static str = "update";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
        };

        let mut update = doc! {
            "q": self.filter.clone(),
            "u": self.update.to_bson(),
        };

        if let Some(ref options) = self.options {
            if let Some(upsert) = options.upsert {
                update.insert("upsert", upsert);
            }
            if let Some(ref array_filters) = options.array_filters {
                update.insert("arrayFilters", bson_util_array(array_filters));
            }
            if let Some(ref hint) = options.hint {
                update.insert("hint", hint.clone());
            }
            if let Some(ref collation) = options.collation {
                update.insert("collation", collation.clone());
            }
            if let Some(bypass_doc_validation) = options.bypass_document_validation {
                body.insert("bypassDocumentValidation", bypass_doc_validation);
            }
            if let Some(ref write_concern) = options.write_concern {
                if !write_concern.is_empty() {
                    body.insert("writeConcern", write_concern.to_document()?);
                }
            }
            if let Some(ref let_vars) = options.let_vars {
                body.insert("let", let_vars.clone());
            }
            if let Some(ref comment) = options.comment {
                body.insert("comment", comment.clone());
            }
        }

        if let Some(multi) = self.multi {
            update.insert("multi", multi);
        }

        body.insert("updates", vec![Bson::Document(update)]);
        body.insert("ordered", true);

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        if !response.is_success() {
            return Err(response.command_error()?);
        }

        let body: WriteResponseBody<UpdateBody> = response.body()?;
        body.validate().map_err(convert_bulk_errors)?;

        let modified_count = body.n_modified;
        let upserted_id = body
            .body
            .upserted
            .as_ref()
            .and_then(|v| v.first())
            .map(|doc| doc.id.clone());

        let matched_count = if upserted_id.is_some() { 0 } else { body.n };

        Ok(UpdateResult {
            matched_count,
            modified_count,
            upserted_id,
        })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options
            .as_ref()
            .and_then(|options| options.write_concern.as_ref())
    }

    fn retryability(&self) -> Retryability {
        if self.multi == Some(true) {
            Retryability::None
        } else {
            Retryability::Write
        }
    }
}

fn bson_util_array(docs: &[Document]) -> Bson {
    Bson::Array(docs.iter().cloned().map(Bson::Document).collect())
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpdateBody {
    upserted: Option<Vec<UpsertedId>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpsertedId {
    #[serde(rename = "_id")]
    id: Bson,
}
