
use std::time::Duration;

use anyhow::Result;
use strum_macros::EnumString;
use thiserror::Error;
use tracing::debug;

use crate::message::{Message, MessageError, Method};
use crate::transaction::{Event, Inner, Transaction, TxKind};

#[derive(Debug, Error)]
pub enum FsmError {
    #[error("invalid state")]
    InvalidState,
    #[error("invalid input")]
    InvalidInput,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, strum_macros::Display)]
pub(crate) enum Input {
    No,

    Req,
    Ack,
    Resp1xx,
    Resp2xx,
    Resp300to699,

    TimerA,
    TimerB,
    TimerD,

    TimerE,
    TimerF,
    TimerK,

    TimerG,
    TimerH,
    TimerI,
    TimerJ,
    Timer100,

    TransportError,
}

#[derive(strum_macros::Display, EnumString, PartialEq, Eq, Clone, Copy, Debug)]
pub enum State {
    Trying,
    Calling,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

pub(crate) fn input_for_code(code: i32) -> Input {
    match code {
        code if code < 200 => Input::Resp1xx,
        code if code < 300 => Input::Resp2xx,
        _ => Input::Resp300to699,
    }
}

/// Drives one transaction FSM. Transitions run under the transaction's own
/// lock; a terminal transition tears the transaction down and releases its
/// channel.
pub(crate) async fn spin(
    inner: &Inner,
    tx: &Transaction,
    input: Input,
) -> Result<()> {
    let guard = tx.lock.lock().await;

    let mut input = input;
    loop {
        let state = tx.state();
        let result = match (tx.method == Method::INVITE, tx.kind) {
            (true, TxKind::Client) => {
                InviteClient::action(inner, tx, &state, &input).await
            }
            (true, TxKind::Server) => {
                InviteServer::action(inner, tx, &state, &input).await
            }
            (false, TxKind::Client) => {
                NonInviteClient::action(inner, tx, &state, &input).await
            }
            (false, TxKind::Server) => {
                NonInviteServer::action(inner, tx, &state, &input).await
            }
        };
        let (new_state, next) = match result {
            Ok(transition) => transition,
            Err(e) => {
                // Stale timers and late retransmissions land here; they are
                // absorbed rather than disturbing the transaction.
                debug!(key = %tx.key, "ignored fsm input {input} in {state}: {e}");
                return Ok(());
            }
        };
        if new_state == State::Terminated {
            drop(guard);
            inner.finish_transaction(tx).await;
            return Ok(());
        }
        tx.set_state(new_state);
        if next == Input::No {
            break;
        }
        input = next;
    }

    Ok(())
}

async fn client_passup(inner: &Inner, tx: &Transaction) -> Input {
    if let Some(response) = tx.response() {
        inner.emit(Event::IncomingResponse(response)).await;
    }
    Input::No
}

async fn client_timeout(inner: &Inner, tx: &Transaction) -> Input {
    inner.emit(Event::TimedOut(tx.request.clone())).await;
    Input::No
}

fn no_action() -> Input {
    Input::No
}

// Resend the stored message, reporting the transport error to the TU once.
async fn resend(inner: &Inner, tx: &Transaction, message: &Message) -> Input {
    match inner.channel_send(&tx.endpoint, message).await {
        Ok(()) => Input::No,
        Err(e) => {
            inner
                .emit(Event::TransportError {
                    request: tx.request.clone(),
                    error: e,
                })
                .await;
            Input::TransportError
        }
    }
}

//                                 |INVITE from TU
//               Timer A fires     |INVITE sent
//               Reset A,          V                      Timer B fires
//               INVITE sent +-----------+                or Transport Err.
//                 +---------|           |---------------+inform TU
//                 |         |  Calling  |               |
//                 +-------->|           |-------------->|
//                           +-----------+ 2xx           |
//                              |  |       2xx to TU     |
//                              |  |1xx                  |
//      300-699 +---------------+  |1xx to TU            |
//     ACK sent |                  |                     |
//  resp. to TU |  1xx             V                     |
//              |  1xx to TU +-----------+               |
//              |  +---------|           |               |
//              |  |         |Proceeding |-------------->|
//              |  +-------->|           | 2xx           |
//              |            +-----------+ 2xx to TU     |
//              |       300-699    |                     |
//              |       ACK sent,  |                     |
//              |       resp. to TU|                     |
//              |                  V                     |
//              |            +-----------+               |
//              |            |           |               |
//              |            | Completed |               |
//              |            |           |               |
//              |            +-----------+               |
//              |              ^   |                     |
//              |              |   | Timer D fires       |
//              +--------------+   | -                   |
//                                 V                     |
//                           +-----------+               |
//                           |           |               |
//                           | Terminated|<--------------+
//                           |           |
//                           +-----------+
//
//                          INVITE client transaction
pub(crate) struct InviteClient;

impl InviteClient {
    pub async fn action(
        inner: &Inner,
        tx: &Transaction,
        state: &State,
        input: &Input,
    ) -> Result<(State, Input), FsmError> {
        match state {
            State::Calling => Self::calling_act(inner, tx, input).await,
            State::Proceeding => Self::proceeding_act(inner, tx, input).await,
            State::Completed => Self::completed_act(inner, tx, input).await,
            _ => Err(FsmError::InvalidState),
        }
    }

    async fn calling_act(
        inner: &Inner,
        tx: &Transaction,
        input: &Input,
    ) -> Result<(State, Input), FsmError> {
        match input {
            Input::Resp1xx => {
                tx.cancel_retry();
                Ok((State::Proceeding, client_passup(inner, tx).await))
            }
            Input::Resp2xx => {
                Ok((State::Terminated, client_passup(inner, tx).await))
            }
            Input::Resp300to699 => {
                Ok((State::Completed, Self::act_300(inner, tx).await))
            }
            Input::TimerA => {
                Ok((State::Calling, Self::client_resend(inner, tx).await))
            }
            Input::TimerB => {
                Ok((State::Terminated, client_timeout(inner, tx).await))
            }
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput),
        }
    }

    async fn proceeding_act(
        inner: &Inner,
        tx: &Transaction,
        input: &Input,
    ) -> Result<(State, Input), FsmError> {
        match input {
            Input::Resp1xx => {
                Ok((State::Proceeding, client_passup(inner, tx).await))
            }
            Input::Resp2xx => {
                Ok((State::Terminated, client_passup(inner, tx).await))
            }
            Input::Resp300to699 => {
                Ok((State::Completed, Self::act_300(inner, tx).await))
            }
            // Timer A or B left over from Calling; a 1xx already arrived.
            Input::TimerA | Input::TimerB => Ok((State::Proceeding, no_action())),
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput),
        }
    }

    async fn completed_act(
        inner: &Inner,
        tx: &Transaction,
        input: &Input,
    ) -> Result<(State, Input), FsmError> {
        match input {
            // Response retransmission: answer it with the ACK again.
            Input::Resp300to699 => {
                Ok((State::Completed, Self::send_ack(inner, tx).await))
            }
            Input::TimerD => Ok((State::Terminated, no_action())),
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput),
        }
    }

    async fn client_resend(inner: &Inner, tx: &Transaction) -> Input {
        let result = resend(inner, tx, &tx.request).await;
        if result != Input::No {
            return result;
        }
        let count = tx.incr_resend();
        let delay = (inner.settings().t1 * 2u32.saturating_pow(count))
            .min(inner.settings().t2);
        tx.arm_retry(inner.dispatch(), delay, Input::TimerA);
        Input::No
    }

    async fn act_300(inner: &Inner, tx: &Transaction) -> Input {
        tx.cancel_retry();
        tx.cancel_timeout();
        client_passup(inner, tx).await;
        let result = Self::send_ack(inner, tx).await;
        if result != Input::No {
            return result;
        }
        let delay = if tx.reliable {
            Duration::from_secs(0)
        } else {
            Duration::from_secs(32)
        };
        tx.arm_terminate(inner.dispatch(), delay, Input::TimerD);
        Input::No
    }

    async fn send_ack(inner: &Inner, tx: &Transaction) -> Input {
        let ack = match build_ack(tx) {
            Ok(ack) => ack,
            Err(e) => {
                debug!(key = %tx.key, "could not build ack: {e}");
                return Input::No;
            }
        };
        resend(inner, tx, &ack).await
    }
}

// The ACK for a non-2xx final response, built from the original request per
// RFC 3261 §17.1.1.3: same Request-URI, topmost Via and Route set, the To
// taken from the response so its tag survives.
fn build_ack(tx: &Transaction) -> Result<Message> {
    let request = &tx.request;
    let uri = request
        .request_uri()
        .ok_or(MessageError::NotRequest)?
        .to_string();
    let mut ack = Message::request(Method::ACK, &uri)?;

    if let Some(via) = request.enumerate_header("Via").next().map(str::to_string)
    {
        ack.add_header(&format!("Via: {}", via))?;
    }
    let routes: Vec<String> = request
        .enumerate_header("Route")
        .map(str::to_string)
        .collect();
    for route in routes {
        ack.add_header(&format!("Route: {}", route))?;
    }
    let to = match tx.response() {
        Some(response) => {
            response.enumerate_header("To").next().map(str::to_string)
        }
        None => None,
    }
    .or_else(|| request.enumerate_header("To").next().map(str::to_string));
    if let Some(to) = to {
        ack.add_header(&format!("To: {}", to))?;
    }
    for name in ["From", "Call-ID"] {
        if let Some(value) =
            request.enumerate_header(name).next().map(str::to_string)
        {
            ack.add_header(&format!("{}: {}", name, value))?;
        }
    }
    let cseq = request.get_cseq().ok_or(MessageError::InvalidMessage)?;
    ack.add_header(&format!("CSeq: {} ACK", cseq.seq))?;
    ack.add_header("Max-Forwards: 70")?;
    ack.add_header("Content-Length: 0")?;
    Ok(ack)
}

//                                   |Request from TU
//                                   |send request
//               Timer E             V
//               send request  +-----------+
//                   +---------|           |-------------------+
//                   |         |  Trying   |  Timer F          |
//                   +-------->|           |  or Transport Err.|
//                             +-----------+  inform TU        |
//                200-699         |  |                         |
//                resp. to TU     |  |1xx                      |
//                +---------------+  |resp. to TU              |
//                |                  |                         |
//                |   Timer E        V       Timer F           |
//                |   send req +-----------+ or Transport Err. |
//                |  +---------|           | inform TU         |
//                |  |         |Proceeding |------------------>|
//                |  +-------->|           |-----+             |
//                |            +-----------+     |1xx          |
//                |              |      ^        |resp to TU   |
//                | 200-699      |      +--------+             |
//                | resp. to TU  |                             |
//                |              |                             |
//                |              V                             |
//                |            +-----------+                   |
//                |            |           |                   |
//                |            | Completed |                   |
//                |            |           |                   |
//                |            +-----------+                   |
//                |              ^   |                         |
//                |              |   | Timer K                 |
//                +--------------+   | -                       |
//                                   |                         |
//                                   V                         |
//             NOTE:           +-----------+                   |
//                             |           |                   |
//         transitions         | Terminated|<------------------+
//         labeled with        |           |
//         the event           +-----------+
//         over the action
//         to take
//
//                            non-INVITE client transaction
pub(crate) struct NonInviteClient;

impl NonInviteClient {
    pub async fn action(
        inner: &Inner,
        tx: &Transaction,
        state: &State,
        input: &Input,
    ) -> Result<(State, Input), FsmError> {
        match state {
            State::Trying => Self::trying_act(inner, tx, input).await,
            State::Proceeding => Self::proceeding_act(inner, tx, input).await,
            State::Completed => Self::completed_act(input),
            _ => Err(FsmError::InvalidState),
        }
    }

    async fn trying_act(
        inner: &Inner,
        tx: &Transaction,
        input: &Input,
    ) -> Result<(State, Input), FsmError> {
        match input {
            Input::TimerE => {
                Ok((State::Trying, Self::trying_resend(inner, tx).await))
            }
            Input::Resp1xx => {
                Ok((State::Proceeding, client_passup(inner, tx).await))
            }
            Input::Resp2xx | Input::Resp300to699 => {
                Ok((State::Completed, Self::act_final(inner, tx).await))
            }
            Input::TimerF => {
                Ok((State::Terminated, client_timeout(inner, tx).await))
            }
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput),
        }
    }

    async fn proceeding_act(
        inner: &Inner,
        tx: &Transaction,
        input: &Input,
    ) -> Result<(State, Input), FsmError> {
        match input {
            Input::TimerE => {
                Ok((State::Proceeding, Self::proceeding_resend(inner, tx).await))
            }
            Input::Resp1xx => {
                Ok((State::Proceeding, client_passup(inner, tx).await))
            }
            Input::Resp2xx | Input::Resp300to699 => {
                Ok((State::Completed, Self::act_final(inner, tx).await))
            }
            Input::TimerF => {
                Ok((State::Terminated, client_timeout(inner, tx).await))
            }
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput),
        }
    }

    fn completed_act(input: &Input) -> Result<(State, Input), FsmError> {
        match input {
            Input::TimerK => Ok((State::Terminated, no_action())),
            // Late response retransmissions and stale timers are absorbed.
            Input::Resp1xx
            | Input::Resp2xx
            | Input::Resp300to699
            | Input::TimerE
            | Input::TimerF => Ok((State::Completed, no_action())),
            _ => Err(FsmError::InvalidInput),
        }
    }

    async fn trying_resend(inner: &Inner, tx: &Transaction) -> Input {
        let result = resend(inner, tx, &tx.request).await;
        if result != Input::No {
            return result;
        }
        let count = tx.incr_resend();
        let delay = (inner.settings().t1 * 2u32.saturating_pow(count))
            .min(inner.settings().t2);
        tx.arm_retry(inner.dispatch(), delay, Input::TimerE);
        Input::No
    }

    async fn proceeding_resend(
        inner: &Inner,
        tx: &Transaction,
    ) -> Input {
        let result = resend(inner, tx, &tx.request).await;
        if result != Input::No {
            return result;
        }
        tx.incr_resend();
        tx.arm_retry(inner.dispatch(), inner.settings().t2, Input::TimerE);
        Input::No
    }

    async fn act_final(inner: &Inner, tx: &Transaction) -> Input {
        tx.cancel_retry();
        tx.cancel_timeout();
        client_passup(inner, tx).await;
        let delay = if tx.reliable {
            Duration::from_secs(0)
        } else {
            inner.settings().t4
        };
        tx.arm_terminate(inner.dispatch(), delay, Input::TimerK);
        Input::No
    }
}

//                                 |INVITE
//                                 |pass INV to TU
//              INVITE             V send 100 if TU won't in 200 ms
//              send response+-----------+
//                  +--------|           |--------+ 101-199 from TU
//                  |        |           |        | send response
//                  +------->|           |<-------+
//                           | Proceeding|
//                           |           |--------------->+
//                           |           | Transport Err. |
//                           |           | Inform TU      |
//                           +-----------+                |
//              300-699 from TU |     |2xx from TU        |
//              send response   |     |send response      |
//                              |     +------------------>+
//                              |                         |
//              INVITE          V          Timer G fires  |
//              send response+-----------+ send response  |
//                  +--------|           |--------+       |
//                  |        | Completed |        |       |
//                  +------->|           |<-------+       |
//                           +-----------+                |
//                              |     |                   |
//                          ACK |     |  Timer H fires    |
//                          -   |     |  or Transport Err.|
//                              |     |  Inform TU        |
//                              V     +------------------>+
//                           +-----------+                |
//                           |           |                |
//                           | Confirmed |                |
//                           |           |                |
//                           +-----------+                |
//                                 |                      |
//                                 |Timer I fires         |
//                                 |-                     |
//                                 V                      |
//                           +-----------+                |
//                           |           |                |
//                           | Terminated|<---------------+
//                           |           |
//                           +-----------+
//
//                          INVITE server transaction
pub(crate) struct InviteServer;

impl InviteServer {
    pub async fn action(
        inner: &Inner,
        tx: &Transaction,
        state: &State,
        input: &Input,
    ) -> Result<(State, Input), FsmError> {
        match state {
            State::Proceeding => Self::proceeding_act(inner, tx, input).await,
            State::Completed => Self::completed_act(inner, tx, input).await,
            State::Confirmed => Self::confirmed_act(input),
            _ => Err(FsmError::InvalidState),
        }
    }

    async fn proceeding_act(
        inner: &Inner,
        tx: &Transaction,
        input: &Input,
    ) -> Result<(State, Input), FsmError> {
        match input {
            // Request retransmission: resend the provisional if one went out.
            Input::Req => Ok((State::Proceeding, server_reply(inner, tx).await)),
            Input::Timer100 => {
                Ok((State::Proceeding, Self::act_100(inner, tx).await))
            }
            Input::Resp1xx => {
                tx.cancel_provisional();
                Ok((State::Proceeding, server_reply(inner, tx).await))
            }
            Input::Resp2xx => {
                tx.cancel_provisional();
                Ok((State::Terminated, server_reply(inner, tx).await))
            }
            Input::Resp300to699 => {
                Ok((State::Completed, Self::act_300(inner, tx).await))
            }
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput),
        }
    }

    async fn completed_act(
        inner: &Inner,
        tx: &Transaction,
        input: &Input,
    ) -> Result<(State, Input), FsmError> {
        match input {
            Input::Req => Ok((State::Completed, server_reply(inner, tx).await)),
            Input::TimerG => {
                Ok((State::Completed, Self::retransmit_final(inner, tx).await))
            }
            Input::Ack => Ok((State::Confirmed, Self::act_ack(inner, tx))),
            Input::TimerH => {
                Ok((State::Terminated, client_timeout(inner, tx).await))
            }
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput),
        }
    }

    fn confirmed_act(input: &Input) -> Result<(State, Input), FsmError> {
        match input {
            // Further ACK retransmissions die here without a TU callback.
            Input::Ack | Input::Req => Ok((State::Confirmed, no_action())),
            Input::TimerI => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput),
        }
    }

    async fn act_100(inner: &Inner, tx: &Transaction) -> Input {
        if tx.last_response().is_some() {
            return Input::No;
        }
        let mut trying =
            match Message::response_from(&tx.request, 100, "Trying") {
                Ok(m) => m,
                Err(e) => {
                    debug!(key = %tx.key, "could not build 100 trying: {e}");
                    return Input::No;
                }
            };
        let server = format!("Server: {}", inner.settings().software_name);
        if trying.add_header(&server).is_err() {
            return Input::No;
        }
        tx.set_last_response(trying);
        server_reply(inner, tx).await
    }

    async fn act_300(inner: &Inner, tx: &Transaction) -> Input {
        tx.cancel_provisional();
        let result = server_reply(inner, tx).await;
        if result != Input::No {
            return result;
        }
        if !tx.reliable {
            tx.arm_retry(inner.dispatch(), inner.settings().t1, Input::TimerG);
        }
        tx.arm_timeout(inner.dispatch(), 64 * inner.settings().t1, Input::TimerH);
        Input::No
    }

    async fn retransmit_final(inner: &Inner, tx: &Transaction) -> Input {
        let result = server_reply(inner, tx).await;
        if result != Input::No {
            return result;
        }
        let count = tx.incr_resend();
        let delay = (inner.settings().t1 * 2u32.saturating_pow(count))
            .min(inner.settings().t2);
        tx.arm_retry(inner.dispatch(), delay, Input::TimerG);
        Input::No
    }

    fn act_ack(inner: &Inner, tx: &Transaction) -> Input {
        tx.cancel_retry();
        tx.cancel_timeout();
        let delay = if tx.reliable {
            Duration::from_secs(0)
        } else {
            inner.settings().t4
        };
        tx.arm_terminate(inner.dispatch(), delay, Input::TimerI);
        Input::No
    }
}

//                                  |Request received
//                                  |pass to TU
//                                  V
//                            +-----------+
//                            |           |
//                            | Trying    |-------------+
//                            |           |             |
//                            +-----------+             |200-699 from TU
//                                  |                   |send response
//                                  |1xx from TU        |
//                                  |send response      |
//                                  |                   |
//               Request            V      1xx from TU  |
//               send response+-----------+send response|
//                   +--------|           |--------+    |
//                   |        | Proceeding|        |    |
//                   +------->|           |<-------+    |
//            +<--------------|           |             |
//            |Trnsprt Err    +-----------+             |
//            |Inform TU            |                   |
//            |                     |                   |
//            |                     |200-699 from TU    |
//            |                     |send response      |
//            |  Request            V                   |
//            |  send response+-----------+             |
//            |      +--------|           |             |
//            |      |        | Completed |<------------+
//            |      +------->|           |
//            +<--------------|           |
//            |Trnsprt Err    +-----------+
//            |Inform TU            |
//            |                     |Timer J fires
//            |                     |-
//            |                     |
//            |                     V
//            |               +-----------+
//            |               |           |
//            +-------------->| Terminated|
//                            |           |
//                            +-----------+
//
//                          non-INVITE server transaction
pub(crate) struct NonInviteServer;

impl NonInviteServer {
    pub async fn action(
        inner: &Inner,
        tx: &Transaction,
        state: &State,
        input: &Input,
    ) -> Result<(State, Input), FsmError> {
        match state {
            State::Trying => Self::trying_act(inner, tx, input).await,
            State::Proceeding => Self::proceeding_act(inner, tx, input).await,
            State::Completed => Self::completed_act(inner, tx, input).await,
            _ => Err(FsmError::InvalidState),
        }
    }

    async fn trying_act(
        inner: &Inner,
        tx: &Transaction,
        input: &Input,
    ) -> Result<(State, Input), FsmError> {
        match input {
            // Retransmission before any response exists: absorbed, the TU
            // is not told twice.
            Input::Req => Ok((State::Trying, no_action())),
            Input::Resp1xx => {
                Ok((State::Proceeding, server_reply(inner, tx).await))
            }
            Input::Resp2xx | Input::Resp300to699 => {
                Ok((State::Completed, Self::act_final(inner, tx).await))
            }
            _ => Err(FsmError::InvalidInput),
        }
    }

    async fn proceeding_act(
        inner: &Inner,
        tx: &Transaction,
        input: &Input,
    ) -> Result<(State, Input), FsmError> {
        match input {
            Input::Req => Ok((State::Proceeding, server_reply(inner, tx).await)),
            Input::Resp1xx => {
                Ok((State::Proceeding, server_reply(inner, tx).await))
            }
            Input::Resp2xx | Input::Resp300to699 => {
                Ok((State::Completed, Self::act_final(inner, tx).await))
            }
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput),
        }
    }

    async fn completed_act(
        inner: &Inner,
        tx: &Transaction,
        input: &Input,
    ) -> Result<(State, Input), FsmError> {
        match input {
            Input::Req => Ok((State::Completed, server_reply(inner, tx).await)),
            Input::TimerJ => Ok((State::Terminated, no_action())),
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput),
        }
    }

    async fn act_final(inner: &Inner, tx: &Transaction) -> Input {
        let result = server_reply(inner, tx).await;
        if result != Input::No {
            return result;
        }
        let delay = if tx.reliable {
            Duration::from_secs(0)
        } else {
            64 * inner.settings().t1
        };
        tx.arm_terminate(inner.dispatch(), delay, Input::TimerJ);
        Input::No
    }
}

// Send the last response out again; used both for first sends (the manager
// stores the response before spinning) and retransmissions.
async fn server_reply(inner: &Inner, tx: &Transaction) -> Input {
    let response = match tx.last_response() {
        Some(r) => r,
        None => return Input::No,
    };
    match inner.channel_send(&tx.endpoint, &response).await {
        Ok(()) => Input::No,
        Err(e) => {
            inner
                .emit(Event::TransportError {
                    request: tx.request.clone(),
                    error: e,
                })
                .await;
            Input::TransportError
        }
    }
}
