//! The matchmaker: every group/queue/party operation behind the HTTP
//! surface, with its event publishing and launch orchestration.
//!
//! Each operation commits its state mutation through the session store
//! first, then issues the associated publish on the bus. When a queue join
//! fills a slot, the launch sequence is scheduled on its own task: freeze
//! the slot into a party, announce `game:starting` to each member group,
//! start the container, announce `game:started` on the party topic, and on
//! container exit tear the party down and announce `game:over`.

use std::sync::Arc;

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::auth::Claims;
use crate::entity::{Game, GameId, GroupId, Party, PartyId, SlotId, UserId};
use crate::error::ApiError;
use crate::kvs::SessionStore;
use crate::launcher::GameLauncher;
use crate::msg::{MessageBus, Topic};
use crate::payloads::{EventMsg, GroupStateMsg, InviteTarget, MemberInfo, UserRef};
use crate::rdb::RelationalDatabase;

#[derive(Clone)]
pub struct Matchmaker {
    inner: Arc<Inner>,
}

struct Inner {
    rdb: Arc<dyn RelationalDatabase>,
    kvs: Arc<dyn SessionStore>,
    bus: Arc<MessageBus>,
    launcher: GameLauncher,
    shutdown: CancellationToken,
}

fn user_ref(claims: &Claims) -> UserRef {
    UserRef {
        userid: claims.uid,
        username: claims.nic.clone(),
    }
}

impl Matchmaker {
    #[must_use]
    pub fn new(
        rdb: Arc<dyn RelationalDatabase>,
        kvs: Arc<dyn SessionStore>,
        bus: Arc<MessageBus>,
        launcher: GameLauncher,
        shutdown: CancellationToken,
    ) -> Self {
        Matchmaker {
            inner: Arc::new(Inner {
                rdb,
                kvs,
                bus,
                launcher,
                shutdown,
            }),
        }
    }

    /// Game lookup for group operations, where a dangling game id is a domain
    /// error rather than a missing resource.
    async fn game_for_group(&self, gameid: GameId) -> Result<Game, ApiError> {
        match self.inner.rdb.get_game_by_id(gameid).await {
            Err(ApiError::NotFound(_)) => Err(ApiError::GameDoesntExist),
            other => other,
        }
    }

    /// Create a fresh group for `userid` on `gameid`.
    ///
    /// # Errors
    /// `GameDoesntExist`, `PlayerInGroupAlready`.
    pub async fn create_group(&self, userid: UserId, gameid: GameId) -> Result<GroupId, ApiError> {
        let game = self.game_for_group(gameid).await?;
        let groupid = self.inner.kvs.create_group(userid, &game).await?;
        info!("Group {groupid} created by {userid} for game {gameid}");
        Ok(groupid)
    }

    /// The caller's group as shown by `GET /v1/groups/`.
    ///
    /// # Errors
    /// `PlayerNotInGroup` when the caller has no session.
    pub async fn group_state(&self, userid: UserId) -> Result<GroupStateMsg, ApiError> {
        let session = self.inner.kvs.get_user(userid).await?;
        let group = self.inner.kvs.get_group(session.groupid).await?;

        let mut members = Vec::with_capacity(group.members.len());
        for member in &group.members {
            let name = self
                .inner
                .rdb
                .get_user_by_id(*member)
                .await
                .map(|u| u.name)
                .unwrap_or_default();
            let ready = self.inner.kvs.is_user_ready(*member).await.unwrap_or(false);
            members.push(MemberInfo {
                id: *member,
                name,
                ready,
            });
        }

        Ok(GroupStateMsg {
            state: group.state.to_string(),
            members,
            gameid: group.gameid,
            slotid: group.slotid,
            partyid: group.partyid,
        })
    }

    /// Join an existing group and announce the arrival to it.
    ///
    /// # Errors
    /// `GroupDoesntExist`, `PlayerInGroupAlready`, `WrongGroupState`,
    /// `GroupIsFull`.
    pub async fn join_group(&self, claims: &Claims, groupid: GroupId) -> Result<(), ApiError> {
        let group = self.inner.kvs.get_group(groupid).await?;
        let game = self.game_for_group(group.gameid).await?;
        self.inner.kvs.join_group(groupid, claims.uid, &game).await?;

        self.inner.bus.send(
            &Topic::Group(groupid),
            &EventMsg::UserJoined {
                user: user_ref(claims),
            },
        );
        Ok(())
    }

    /// Leave the caller's group, detaching it from any queue first.
    ///
    /// # Errors
    /// `PlayerNotInGroup`, `WrongGroupState` when playing.
    pub async fn leave_group(&self, claims: &Claims) -> Result<(), ApiError> {
        let session = self.inner.kvs.get_user(claims.uid).await?;
        self.inner.kvs.leave_group(claims.uid).await?;

        self.inner.bus.send(
            &Topic::Group(session.groupid),
            &EventMsg::UserLeft {
                user: user_ref(claims),
            },
        );
        Ok(())
    }

    /// Administrative removal of `target` from their group. The published
    /// event names the kicked user, not the admin.
    ///
    /// # Errors
    /// `NotFound` when the target has no session; otherwise as `leave_group`.
    pub async fn kick_from_group(&self, target: UserId) -> Result<(), ApiError> {
        let session = match self.inner.kvs.get_user(target).await {
            Err(ApiError::PlayerNotInGroup) => {
                return Err(ApiError::NotFound("User not in group".to_string()));
            }
            other => other?,
        };
        self.inner.kvs.leave_group(target).await?;

        let username = self.inner.rdb.get_user_by_id(target).await.map(|u| u.name).ok();
        self.inner.bus.send(
            &Topic::Group(session.groupid),
            &EventMsg::UserLeft {
                user: UserRef {
                    userid: target,
                    username,
                },
            },
        );
        Ok(())
    }

    /// Flag the caller ready and tell the group.
    ///
    /// # Errors
    /// `PlayerNotInGroup`, `WrongGroupState` outside `GROUP_CHECK`.
    pub async fn mark_ready(&self, claims: &Claims) -> Result<(), ApiError> {
        self.inner.kvs.mark_ready(claims.uid).await?;
        let session = self.inner.kvs.get_user(claims.uid).await?;
        self.inner.bus.send(
            &Topic::Group(session.groupid),
            &EventMsg::UserReady {
                user: user_ref(claims),
            },
        );
        Ok(())
    }

    /// Clear the caller's ready flag, pulling the group out of the queue if it
    /// was waiting there.
    ///
    /// # Errors
    /// `PlayerNotInGroup`, `WrongGroupState` when playing.
    pub async fn mark_not_ready(&self, claims: &Claims) -> Result<(), ApiError> {
        self.inner.kvs.mark_not_ready(claims.uid).await?;
        let session = self.inner.kvs.get_user(claims.uid).await?;
        self.inner.bus.send(
            &Topic::Group(session.groupid),
            &EventMsg::UserNotReady {
                user: user_ref(claims),
            },
        );
        Ok(())
    }

    /// Invite a user (by id) to the caller's group: publishes the invitation
    /// on the target's user topic.
    ///
    /// # Errors
    /// `NotFound` for an unknown target, `PlayerNotInGroup` when the caller
    /// has no group.
    pub async fn invite(&self, claims: &Claims, target: UserId) -> Result<(), ApiError> {
        self.inner.rdb.get_user_by_id(target).await?;
        let session = self.inner.kvs.get_user(claims.uid).await?;
        let group = self.inner.kvs.get_group(session.groupid).await?;
        let game = self.game_for_group(group.gameid).await?;

        self.inner.bus.send(
            &Topic::User(target),
            &EventMsg::InvitationReceived {
                from: user_ref(claims),
                to: InviteTarget {
                    groupid: group.groupid,
                    gameid: game.gameid,
                    gamename: game.name,
                },
            },
        );
        Ok(())
    }

    /// Invite by username or email.
    ///
    /// # Errors
    /// As [`Matchmaker::invite`].
    pub async fn invite_by_login(&self, claims: &Claims, login: &str) -> Result<(), ApiError> {
        let target = self.inner.rdb.get_user_by_login(login).await?;
        self.invite(claims, target.userid).await
    }

    /// Queue the caller's group. If the packing pass fills a slot, the launch
    /// sequence is scheduled asynchronously.
    ///
    /// # Errors
    /// `PlayerNotInGroup`, `WrongGroupState`, `GroupNotReady`.
    pub async fn join_queue(&self, claims: &Claims) -> Result<(), ApiError> {
        let session = self.inner.kvs.get_user(claims.uid).await?;
        let group = self.inner.kvs.get_group(session.groupid).await?;
        let game = self.game_for_group(group.gameid).await?;

        let filled = self.inner.kvs.join_queue(session.groupid, &game).await?;
        self.inner.bus.send(&Topic::Group(session.groupid), &EventMsg::QueueJoined);

        if let Some(slotid) = filled {
            let mm = self.clone();
            tokio::spawn(async move {
                mm.start_and_launch(game, slotid).await;
            });
        }
        Ok(())
    }

    /// Freeze a filled slot into a party and drive the container lifecycle.
    async fn start_and_launch(&self, game: Game, slotid: SlotId) {
        let slot = match self.inner.kvs.get_slot(slotid).await {
            Ok(slot) => slot,
            Err(e) => {
                warn!("Filled slot {slotid} disappeared before start: {e}");
                return;
            }
        };
        let party = match self.inner.kvs.start_game(&game, slotid).await {
            Ok(party) => party,
            Err(e) => {
                error!("Cannot start game on slot {slotid}: {e}");
                return;
            }
        };

        for groupid in &slot.groups {
            self.inner.bus.send(
                &Topic::Group(*groupid),
                &EventMsg::GameStarting {
                    partyid: party.partyid,
                },
            );
        }

        self.launch_party(game, party).await;
    }

    /// Launch the container for `party` and see it through to `game:over`.
    /// On launch failure nothing is announced as started; the party is ended
    /// so its groups return to `GROUP_CHECK`.
    pub async fn launch_party(&self, game: Game, party: Party) {
        match self.inner.launcher.launch(&game, &party) {
            Ok(running) => {
                self.inner.bus.send(
                    &Topic::Party(party.partyid),
                    &EventMsg::GameStarted {
                        host: party.host.clone(),
                        ports: party.external_ports.clone(),
                    },
                );
                if running.wait(&self.inner.shutdown).await.is_none() {
                    // Shutdown abandoned the wait; leave the container to the host.
                    return;
                }
            }
            Err(e) => {
                error!("Launch failed for party {}: {e}", party.partyid);
            }
        }

        if let Err(e) = self.end_game(party.partyid).await {
            error!("Cannot end party {}: {e}", party.partyid);
        }
    }

    /// Tear a party down: groups back to `GROUP_CHECK`, sessions cleared,
    /// `game:over` on the party topic.
    ///
    /// # Errors
    /// `PartyDoesntExist`.
    pub async fn end_game(&self, partyid: PartyId) -> Result<(), ApiError> {
        self.inner.kvs.end_game(partyid).await?;
        self.inner.bus.send(&Topic::Party(partyid), &EventMsg::GameOver);
        info!("Party {partyid} over");
        Ok(())
    }
}
