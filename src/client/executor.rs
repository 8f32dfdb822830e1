use std::time::Instant;

use bson::Document;

use super::{session::TransactionState, Client, ClientSession};
use crate::{
    cmap::{Command, Connection, RawCommandResponse},
    error::{
        Error, ErrorKind, Result, RETRYABLE_WRITE_ERROR, TRANSIENT_TRANSACTION_ERROR,
        UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    event::command::{CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent},
    operation::{
        AbortTransaction, CommitTransaction, Operation, Retryability,
        SERVER_4_2_0_WIRE_VERSION,
    },
    options::ServerAddress,
    sdam::{
        HandshakePhase, SelectedServer, ServerType, SessionSupportStatus, TopologyType,
    },
    selection_criteria::{ReadPreference, SelectionCriteria},
};

impl Client {
    /// Execute the given operation.
    ///
    /// Server selection will be performed using the criteria specified on the operation, if
    /// any, and an implicit session will be created if the operation and write concern are
    /// compatible with sessions and an explicit session is not provided.
    pub(crate) async fn execute_operation<T: Operation>(
        &self,
        op: T,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<T::O> {
        match session.into() {
            Some(session) => {
                if let Some(SelectionCriteria::ReadPreference(read_preference)) =
                    op.selection_criteria()
                {
                    if session.in_transaction() && read_preference != &ReadPreference::Primary {
                        return Err(ErrorKind::Transaction {
                            message: "read preference in a transaction must be primary".into(),
                        }
                        .into());
                    }
                }
                self.execute_operation_with_retry(op, Some(session)).await
            }
            None => {
                let mut implicit_session = self.start_implicit_session(&op).await?;
                self.execute_operation_with_retry(op, implicit_session.as_mut())
                    .await
            }
        }
    }

    /// Execute the given operation, returning the implicit session created for it if one
    /// was. Used by cursor-producing operations, whose getMores must run under the same
    /// session.
    pub(crate) async fn execute_cursor_operation<T: Operation>(
        &self,
        op: T,
    ) -> Result<(T::O, Option<ClientSession>)> {
        let mut implicit_session = self.start_implicit_session(&op).await?;
        self.execute_operation_with_retry(op, implicit_session.as_mut())
            .await
            .map(|result| (result, implicit_session))
    }

    /// Selects a server and executes the given operation on it, optionally using a provided
    /// session. Retries the operation at most once upon failure if retryability is
    /// supported.
    async fn execute_operation_with_retry<T: Operation>(
        &self,
        mut op: T,
        mut session: Option<&mut ClientSession>,
    ) -> Result<T::O> {
        // If the current transaction has been committed/aborted and it is not being
        // re-committed/re-aborted, reset the transaction's state to TransactionState::None.
        if let Some(ref mut session) = session {
            if matches!(session.transaction.state, TransactionState::Committed { .. })
                && op.name() != CommitTransaction::NAME
                || session.transaction.state == TransactionState::Aborted
                    && op.name() != AbortTransaction::NAME
            {
                session.transaction.reset();
            }
        }

        let pinned_criteria = self.pinned_criteria(&op, &session);
        let selection_criteria = pinned_criteria
            .as_ref()
            .or_else(|| op.selection_criteria());

        let server = match self.select_server(selection_criteria, &[]).await {
            Ok(server) => server,
            Err(mut err) => {
                add_error_labels(&mut err, None, &mut session, None)?;
                return Err(err);
            }
        };

        let deadline = self.selection_deadline();
        let mut conn = match server.pool().check_out(deadline).await {
            Ok(conn) => conn,
            Err(mut err) => {
                self.inner
                    .topology
                    .handle_application_error(
                        server.address().clone(),
                        err.clone(),
                        HandshakePhase::PreHandshake,
                    )
                    .await;
                add_error_labels(&mut err, None, &mut session, None)?;
                let failed_address = server.address().clone();
                drop(server);
                if err.is_network_error() {
                    return self
                        .execute_retry(&mut op, &mut session, None, err, failed_address)
                        .await;
                }
                return Err(err);
            }
        };

        let retryability = self.get_retryability(&conn, &op, &session)?;

        let txn_number = match session {
            Some(ref mut session) => {
                if session.transaction.state != TransactionState::None {
                    Some(session.txn_number())
                } else {
                    match retryability {
                        Retryability::Write => Some(session.get_and_increment_txn_number()),
                        _ => None,
                    }
                }
            }
            None => None,
        };

        match self
            .execute_operation_on_connection(&mut op, &mut conn, &mut session, txn_number, retryability)
            .await
        {
            Ok(result) => Ok(result),
            Err(err) => {
                self.inner
                    .topology
                    .handle_application_error(
                        server.address().clone(),
                        err.clone(),
                        HandshakePhase::after_completion(&conn),
                    )
                    .await;
                // Release the connection for the pool to inspect, then the server handle.
                drop(conn);
                let failed_address = server.address().clone();
                drop(server);

                if retryability == Retryability::Read && err.is_read_retryable()
                    || retryability == Retryability::Write && err.is_write_retryable()
                {
                    self.execute_retry(&mut op, &mut session, txn_number, err, failed_address)
                        .await
                } else {
                    Err(err)
                }
            }
        }
    }

    /// The single permitted retry of an operation. The server the first attempt failed on
    /// is deprioritized so the retry lands elsewhere whenever an alternative is selectable.
    async fn execute_retry<T: Operation>(
        &self,
        op: &mut T,
        session: &mut Option<&mut ClientSession>,
        txn_number: Option<i64>,
        first_error: Error,
        failed_address: ServerAddress,
    ) -> Result<T::O> {
        op.update_for_retry();

        let pinned_criteria = self.pinned_criteria(op, session);
        let selection_criteria = pinned_criteria
            .as_ref()
            .or_else(|| op.selection_criteria());

        let server = match self
            .select_server(selection_criteria, std::slice::from_ref(&failed_address))
            .await
        {
            Ok(server) => server,
            Err(_) => return Err(first_error),
        };

        let deadline = self.selection_deadline();
        let mut conn = match server.pool().check_out(deadline).await {
            Ok(c) => c,
            Err(_) => return Err(first_error),
        };

        let retryability = self.get_retryability(&conn, op, session)?;
        if retryability == Retryability::None {
            return Err(first_error);
        }

        match self
            .execute_operation_on_connection(op, &mut conn, session, txn_number, retryability)
            .await
        {
            Ok(result) => Ok(result),
            Err(err) => {
                self.inner
                    .topology
                    .handle_application_error(
                        server.address().clone(),
                        err.clone(),
                        HandshakePhase::after_completion(&conn),
                    )
                    .await;

                if err.is_server_error() || err.is_read_retryable() || err.is_write_retryable() {
                    Err(err)
                } else {
                    Err(first_error)
                }
            }
        }
    }

    /// Executes an operation on a given connection, optionally using a provided session.
    async fn execute_operation_on_connection<T: Operation>(
        &self,
        op: &mut T,
        connection: &mut Connection,
        session: &mut Option<&mut ClientSession>,
        txn_number: Option<i64>,
        retryability: Retryability,
    ) -> Result<T::O> {
        if let Some(wc) = op.write_concern() {
            wc.validate()?;
        }

        let stream_description = connection.stream_description()?.clone();
        let is_sharded = stream_description.initial_server_type == ServerType::Mongos;
        let mut cmd = op.build(&stream_description)?;
        self.update_command_with_read_pref(&stream_description, &mut cmd, op.selection_criteria());

        match session {
            Some(ref mut session) if op.supports_sessions() && op.is_acknowledged() => {
                if session.in_transaction() && op.write_concern().is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "cannot set a write concern on an individual operation \
                                  inside a transaction"
                            .to_string(),
                    }
                    .into());
                }

                cmd.set_session(session);
                if let Some(txn_number) = txn_number {
                    cmd.set_txn_number(txn_number);
                }
                match session.transaction.state {
                    TransactionState::Starting => {
                        cmd.set_start_transaction();
                        cmd.set_autocommit();
                        cmd.set_txn_read_concern(session)?;
                        if is_sharded {
                            session.pin_to_address(connection.address().clone());
                        }
                        session.transaction.state = TransactionState::InProgress;
                    }
                    TransactionState::InProgress => cmd.set_autocommit(),
                    TransactionState::Committed { .. } | TransactionState::Aborted => {
                        cmd.set_autocommit();
                        if is_sharded {
                            if let Some(ref recovery_token) = session.transaction.recovery_token {
                                cmd.body
                                    .insert("recoveryToken", recovery_token.clone());
                            }
                        }
                    }
                    TransactionState::None => {}
                }
                session.update_last_use();
            }
            Some(ref session) if !op.supports_sessions() && !session.is_implicit() => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("{} does not support sessions", cmd.name),
                }
                .into());
            }
            Some(ref session) if !op.is_acknowledged() && !session.is_implicit() => {
                return Err(ErrorKind::InvalidArgument {
                    message: "cannot use ClientSessions with unacknowledged write concern"
                        .to_string(),
                }
                .into());
            }
            _ => {}
        }

        let session_cluster_time = session.as_ref().and_then(|session| session.cluster_time());
        let client_cluster_time = self.inner.topology.cluster_time();
        let max_cluster_time =
            std::cmp::max(session_cluster_time, client_cluster_time.as_ref());
        if let Some(cluster_time) = max_cluster_time {
            cmd.set_cluster_time(cluster_time);
        }

        // The assembled command plus any payload sections must fit in one message.
        let message_size = cmd.encoded_size()?;
        let max_message_size = stream_description.max_message_size_bytes as usize;
        if message_size > max_message_size {
            return Err(Error::invalid_argument(format!(
                "assembled command size {} exceeds maxMessageSizeBytes {}",
                message_size, max_message_size
            )));
        }

        let connection_info = connection.info();
        let request_id = crate::cmap::conn::next_request_id();

        self.emit_command_event(|handler| {
            let command_body = if cmd.should_redact() {
                Document::new()
            } else {
                cmd.body.clone()
            };
            handler.handle_command_started_event(CommandStartedEvent {
                command: command_body,
                db: cmd.target_db.clone(),
                command_name: cmd.name.clone(),
                request_id,
                connection: connection_info.clone(),
            });
        });

        let start_time = Instant::now();
        let cmd_name = cmd.name.clone();
        let should_redact = cmd.should_redact();

        let command_result = match connection.send_command(cmd, request_id).await {
            Ok(response) => {
                self.update_cluster_time(&response, session).await;
                if response.is_success() {
                    // A sharded transaction's recovery token allows commit/abort to be
                    // retargeted after a failover.
                    if is_sharded {
                        if let Some(ref mut session) = session {
                            if session.in_transaction() {
                                if let Some(token) = response.recovery_token() {
                                    session.transaction.recovery_token = Some(token);
                                }
                            }
                        }
                    }
                    Ok(response)
                } else {
                    Err(response.command_error().unwrap_or_else(|e| e))
                }
            }
            Err(err) => Err(err),
        };

        let duration = start_time.elapsed();

        match command_result {
            Err(mut err) => {
                self.emit_command_event(|handler| {
                    handler.handle_command_failed_event(CommandFailedEvent {
                        duration,
                        command_name: cmd_name.clone(),
                        failure: err.clone(),
                        request_id,
                        connection: connection_info.clone(),
                    });
                });

                if let Some(ref mut session) = session {
                    if err.is_network_error() {
                        session.mark_dirty();
                    }
                }

                err.wire_version = stream_description.max_wire_version;
                add_error_labels(&mut err, Some(connection), session, Some(retryability))?;
                op.handle_error(err)
            }
            Ok(response) => {
                self.emit_command_event(|handler| {
                    let reply = if should_redact {
                        Document::new()
                    } else {
                        response.to_document().unwrap_or_default()
                    };
                    handler.handle_command_succeeded_event(CommandSucceededEvent {
                        duration,
                        reply,
                        command_name: cmd_name.clone(),
                        request_id,
                        connection: connection_info.clone(),
                    });
                });

                match op.handle_response(response, &stream_description) {
                    Ok(result) => Ok(result),
                    Err(mut err) => {
                        err.wire_version = stream_description.max_wire_version;
                        add_error_labels(&mut err, Some(connection), session, Some(retryability))?;
                        Err(err)
                    }
                }
            }
        }
    }

    /// The selection criteria implied by pinning: a transaction pinned to a mongos or a
    /// cursor pinned to its originating server.
    fn pinned_criteria<T: Operation>(
        &self,
        op: &T,
        session: &Option<&mut ClientSession>,
    ) -> Option<SelectionCriteria> {
        let pinned_address = session
            .as_ref()
            .and_then(|session| session.pinned_address().cloned())
            .or_else(|| op.pinned_address().cloned());
        pinned_address.map(|address| {
            SelectionCriteria::Predicate(std::sync::Arc::new(move |server| {
                server.address() == &address
            }))
        })
    }

    /// Appends `$readPreference` to the command when the selected server needs it to route
    /// correctly: always on mongos for non-primary modes, and for all modes when the
    /// topology is a direct connection to a replica set member.
    fn update_command_with_read_pref(
        &self,
        stream_description: &crate::cmap::StreamDescription,
        cmd: &mut Command,
        criteria: Option<&SelectionCriteria>,
    ) {
        let read_preference = match criteria {
            Some(SelectionCriteria::ReadPreference(rp)) => rp.clone(),
            _ => ReadPreference::Primary,
        };

        let requires_read_pref = match stream_description.initial_server_type {
            ServerType::Mongos | ServerType::LoadBalancer => !matches!(
                read_preference,
                ReadPreference::Primary | ReadPreference::SecondaryPreferred { .. }
            ),
            _ => {
                self.inner.topology.topology_type() == TopologyType::Single
                    && stream_description.initial_server_type != ServerType::Standalone
            }
        };

        if requires_read_pref {
            let _ = cmd.set_read_preference(&read_preference);
        }
    }

    /// Start an implicit session if the operation and write concern are compatible with
    /// sessions.
    async fn start_implicit_session<T: Operation>(&self, op: &T) -> Result<Option<ClientSession>> {
        match self.get_session_support_status().await? {
            SessionSupportStatus::Supported {
                logical_session_timeout,
            } if op.supports_sessions() && op.is_acknowledged() => Ok(Some(
                self.start_session_with_timeout(logical_session_timeout, None, true)
                    .await,
            )),
            _ => Ok(None),
        }
    }

    /// Gets whether the topology supports sessions, and if so, returns the topology's
    /// logical session timeout. If it has yet to be determined if the topology supports
    /// sessions, this method will perform a server selection that will force that
    /// determination to be made.
    pub(crate) async fn get_session_support_status(&self) -> Result<SessionSupportStatus> {
        let initial_status = self.inner.topology.session_support_status();

        // Need to be connected to at least one server that can determine if sessions are
        // supported or not.
        match initial_status {
            SessionSupportStatus::Undetermined => {
                let criteria = SelectionCriteria::Predicate(std::sync::Arc::new(
                    move |server_info: &crate::sdam::public::ServerInfo| {
                        server_info.server_type().is_data_bearing()
                    },
                ));
                let _: SelectedServer = self.select_server(Some(&criteria), &[]).await?;
                Ok(self.inner.topology.session_support_status())
            }
            _ => Ok(initial_status),
        }
    }

    /// Gets whether the topology supports transactions, forcing a server selection to
    /// determine it if necessary.
    pub(crate) async fn transaction_support_status(
        &self,
    ) -> Result<crate::sdam::TransactionSupportStatus> {
        let initial_status = self.inner.topology.transaction_support_status();

        match initial_status {
            crate::sdam::TransactionSupportStatus::Undetermined => {
                let criteria = SelectionCriteria::Predicate(std::sync::Arc::new(
                    move |server_info: &crate::sdam::public::ServerInfo| {
                        server_info.server_type().is_data_bearing()
                    },
                ));
                let _: SelectedServer = self.select_server(Some(&criteria), &[]).await?;
                Ok(self.inner.topology.transaction_support_status())
            }
            _ => Ok(initial_status),
        }
    }

    /// Returns the retryability level for the execution of this operation.
    fn get_retryability<T: Operation>(
        &self,
        conn: &Connection,
        op: &T,
        session: &Option<&mut ClientSession>,
    ) -> Result<Retryability> {
        if !session
            .as_ref()
            .map(|session| session.in_transaction())
            .unwrap_or(false)
        {
            match op.retryability() {
                Retryability::Read if self.inner.options.retry_reads != Some(false) => {
                    return Ok(Retryability::Read);
                }
                // commitTransaction and abortTransaction are always retried regardless of
                // the value of retry_writes set on the Client.
                Retryability::Write
                    if op.name() == CommitTransaction::NAME
                        || op.name() == AbortTransaction::NAME =>
                {
                    return Ok(Retryability::Write);
                }
                Retryability::Write
                    if conn.stream_description()?.supports_retryable_writes()
                        && op.is_acknowledged()
                        && self.inner.options.retry_writes != Some(false) =>
                {
                    return Ok(Retryability::Write);
                }
                _ => {}
            }
        }
        Ok(Retryability::None)
    }

    async fn update_cluster_time(
        &self,
        response: &RawCommandResponse,
        session: &mut Option<&mut ClientSession>,
    ) {
        if let Some(cluster_time) = response.cluster_time() {
            self.inner
                .topology
                .advance_cluster_time(cluster_time.clone())
                .await;
            if let Some(ref mut session) = session {
                session.advance_cluster_time(&cluster_time);
            }
        }

        if let Some(operation_time) = response.operation_time() {
            if let Some(ref mut session) = session {
                session.advance_operation_time(operation_time);
            }
        }
    }
}

/// Adds the necessary labels to this error, and unpins the session if needed.
///
/// A TransientTransactionError label is added if a transaction is in progress and the
/// error is a network or server selection error.
///
/// On a pre-4.2 connection, a RetryableWriteError label is added to any write-retryable
/// error; on a 4.2+ connection, the label is only added client-side to network errors,
/// since the server supplies it otherwise. A label is only added when the operation being
/// executed is write-retryable and no TransientTransactionError label is present.
///
/// If the TransientTransactionError or UnknownTransactionCommitResult labels are added,
/// the session is unpinned.
fn add_error_labels(
    error: &mut Error,
    conn: Option<&Connection>,
    session: &mut Option<&mut ClientSession>,
    retryability: Option<Retryability>,
) -> Result<()> {
    let transaction_state = session
        .as_ref()
        .map_or(&TransactionState::None, |session| {
            &session.transaction.state
        });
    let max_wire_version = match conn {
        Some(conn) => conn.stream_description()?.max_wire_version,
        None => error.wire_version,
    }
    .unwrap_or(SERVER_4_2_0_WIRE_VERSION);

    match transaction_state {
        TransactionState::Starting | TransactionState::InProgress => {
            if error.is_network_error() || error.is_server_selection_error() {
                error.add_label(TRANSIENT_TRANSACTION_ERROR);
            }
        }
        TransactionState::Committed { .. } => {
            if error.should_add_retryable_write_label(max_wire_version) {
                error.add_label(RETRYABLE_WRITE_ERROR);
            }
            if error.should_add_unknown_transaction_commit_result_label() {
                error.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
            }
        }
        TransactionState::Aborted => {
            if error.should_add_retryable_write_label(max_wire_version) {
                error.add_label(RETRYABLE_WRITE_ERROR);
            }
        }
        TransactionState::None => {
            if retryability == Some(Retryability::Write)
                && error.should_add_retryable_write_label(max_wire_version)
            {
                error.add_label(RETRYABLE_WRITE_ERROR);
            }
        }
    }

    if let Some(ref mut session) = session {
        if error.contains_label(TRANSIENT_TRANSACTION_ERROR)
            || error.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
        {
            session.unpin();
        }
    }

    Ok(())
}
