mod calls;
mod conferences;
mod contacts;
mod conversations;
mod pubsub;
mod queues;

pub use calls::{Calls, CallsState, NS_AC, NS_AC_REG, NS_AC_RESOURCE, NS_AC_SPY};

pub use conferences::{
    Conferences, ConferencesState, NS_CONFERENCE, NS_CONFERENCE_MODERATOR, NS_CONFERENCE_USER,
};

pub use contacts::{Contacts, ContactsState, NS_CONTACTS, parse_presence};

pub use conversations::{Conversations, parse_chat};

pub use pubsub::{
    NS_PUB, NS_PUB_EXECUTE, NS_PUB_PULL, NS_PUB_SUBSCRIBE, NodeCallback, PubSub, PubSubState,
    SubscriptionId, parse_pub_event,
};

pub use queues::{NS_CC, NS_CC_CALL, Queues, QueuesState};
